use std::sync::Arc;

use telemd::{
    parse_uid, AccessError, AccessGate, BuildMode, CallerIdentity, DaemonStats, GrantTable,
    AID_ROOT, AID_SHELL, AID_SYSTEM, PERMISSION_DUMP, TRACED_PROBES_CONTEXT,
};

fn gate(build_mode: BuildMode) -> (AccessGate, Arc<DaemonStats>) {
    let stats = Arc::new(DaemonStats::new());
    (AccessGate::new(build_mode, stats.clone()), stats)
}

#[test]
fn uid_check_passes_for_expected_or_privileged_caller() {
    let (gate, stats) = gate(BuildMode::User);

    assert!(gate.check_uid(&CallerIdentity::new(1, AID_SYSTEM), AID_SYSTEM).is_ok());
    assert!(gate.check_uid(&CallerIdentity::new(1, AID_ROOT), AID_SYSTEM).is_ok());
    assert_eq!(
        gate.check_uid(&CallerIdentity::new(1, 10_123), AID_SYSTEM),
        Err(AccessError::UidMismatch {
            expected: AID_SYSTEM,
            actual: 10_123
        })
    );
    assert!(gate
        .check_uid(&CallerIdentity::new(1, AID_SHELL), AID_SYSTEM)
        .is_err());
    assert_eq!(stats.snapshot().access_rejections, 2);
}

#[test]
fn context_check_requires_matching_label_unless_privileged() {
    let (gate, _stats) = gate(BuildMode::User);
    let probes = CallerIdentity::new(7, 9999).with_context(TRACED_PROBES_CONTEXT);
    let other = CallerIdentity::new(7, 9999).with_context("u:r:untrusted_app:s0");
    let unlabeled = CallerIdentity::new(7, 9999);

    assert!(gate.check_context(&probes, TRACED_PROBES_CONTEXT).is_ok());
    assert!(gate
        .check_context(&CallerIdentity::new(7, AID_ROOT), TRACED_PROBES_CONTEXT)
        .is_ok());
    assert!(matches!(
        gate.check_context(&other, TRACED_PROBES_CONTEXT),
        Err(AccessError::ContextMismatch { .. })
    ));
    assert_eq!(
        gate.check_context(&unlabeled, TRACED_PROBES_CONTEXT),
        Err(AccessError::ContextMismatch {
            expected: TRACED_PROBES_CONTEXT.to_string(),
            actual: None
        })
    );
}

#[test]
fn permission_check_consults_the_oracle() {
    let (gate, _stats) = gate(BuildMode::User);
    let grants = GrantTable::new().grant(PERMISSION_DUMP, AID_SHELL);

    assert!(gate
        .check_permission(&CallerIdentity::new(3, AID_SHELL), PERMISSION_DUMP, &grants)
        .is_ok());
    assert_eq!(
        gate.check_permission(&CallerIdentity::new(3, 10_001), PERMISSION_DUMP, &grants),
        Err(AccessError::PermissionDenied {
            permission: PERMISSION_DUMP.to_string(),
            pid: 3,
            uid: 10_001
        })
    );
}

#[test]
fn shell_check_admits_root_and_shell_only() {
    let (gate, _stats) = gate(BuildMode::Eng);
    assert!(gate.check_shell(&CallerIdentity::new(1, AID_ROOT)).is_ok());
    assert!(gate.check_shell(&CallerIdentity::new(1, AID_SHELL)).is_ok());
    assert_eq!(
        gate.check_shell(&CallerIdentity::new(1, AID_SYSTEM)),
        Err(AccessError::ShellRequired(AID_SYSTEM))
    );
}

#[test]
fn uid_strings_follow_strtol_base_detection() {
    assert_eq!(parse_uid("2000"), Ok(2000));
    assert_eq!(parse_uid("0x7d0"), Ok(2000));
    assert_eq!(parse_uid("0X7D0"), Ok(2000));
    assert_eq!(parse_uid("03720"), Ok(2000));
    assert_eq!(parse_uid("0"), Ok(0));
    assert_eq!(parse_uid("  +15"), Ok(15));
    assert_eq!(parse_uid("-0"), Ok(0));
    assert_eq!(parse_uid("4294967295"), Ok(u32::MAX));
}

#[test]
fn malformed_uid_strings_are_rejected() {
    for raw in ["", "   ", "abc", "12abc", "12 ", "-1", "-", "0x", "089", "4294967296", "1.5"] {
        assert_eq!(
            parse_uid(raw),
            Err(AccessError::MalformedUid(raw.to_string())),
            "{raw:?} should be rejected"
        );
    }
}

#[test]
fn impersonation_on_user_builds() {
    let (gate, _stats) = gate(BuildMode::User);
    let root = CallerIdentity::new(1, AID_ROOT);
    let shell = CallerIdentity::new(1, AID_SHELL);

    assert_eq!(gate.resolve_target_uid(&shell, "2000"), Ok(AID_SHELL));
    assert_eq!(gate.resolve_target_uid(&root, "2000"), Ok(AID_SHELL));
    assert_eq!(gate.resolve_target_uid(&root, "0"), Ok(AID_ROOT));
    assert_eq!(
        gate.resolve_target_uid(&shell, "1000"),
        Err(AccessError::ImpersonationDenied {
            caller: AID_SHELL,
            target: AID_SYSTEM
        })
    );
    assert_eq!(
        gate.resolve_target_uid(&root, "10001"),
        Err(AccessError::ImpersonationDenied {
            caller: AID_ROOT,
            target: 10_001
        })
    );
}

#[test]
fn debuggable_builds_allow_any_impersonation() {
    for mode in [BuildMode::UserDebug, BuildMode::Eng] {
        let (gate, _stats) = gate(mode);
        let shell = CallerIdentity::new(1, AID_SHELL);
        assert_eq!(gate.resolve_target_uid(&shell, "10001"), Ok(10_001));
        assert!(matches!(
            gate.resolve_target_uid(&shell, "ten"),
            Err(AccessError::MalformedUid(_))
        ));
    }
    assert!(BuildMode::Eng.is_debuggable());
    assert!(!BuildMode::User.is_debuggable());
}
