//! Coordination core of an on-device telemetry daemon: event ingestion, the
//! boot-complete barrier, companion alarm scheduling, crash/shutdown recovery
//! and boundary access checks.

pub mod access;
pub mod alarm;
pub mod app;
pub mod clock;
pub mod companion;
pub mod config;
pub mod engine;
pub mod event;
pub mod external;
pub mod logging;
pub mod pump;
pub mod queue;
pub mod readiness;
pub mod recovery;
pub mod service;
pub mod stats;
pub mod storage;
pub mod subscription;

pub use access::{
    parse_uid, AccessError, AccessGate, BuildMode, CallerIdentity, GrantTable, PermissionOracle,
    AID_ROOT, AID_SHELL, AID_SYSTEM, PERMISSION_DUMP, PERMISSION_REGISTER_PULL_ATOM,
    PRIVILEGED_UID, TRACED_PROBES_CONTEXT,
};
pub use alarm::{AlarmError, AlarmHandle, AlarmKind, AlarmMonitor, DEFAULT_MIN_ALARM_DIFF_SECS};
pub use clock::{Clock, ManualClock, SystemClock, NS_PER_SEC};
pub use companion::{CompanionError, CompanionSlot, DeathRecipient, StatsCompanion};
pub use config::{ConfigError, DaemonConfig, CONFIG_PATH_ENV, DEFAULT_STORAGE_DIR};
pub use engine::{
    share, ActivationRule, ActiveConfigRecord, ActiveConfigsSnapshot, ActiveMetricRecord,
    AggregationEngine, AlertMetadataRecord, AlertRule, ConfigDefinition, ConfigKey,
    ConfigMetadataRecord, DumpLatency, DumpReason, EngineError, InMemoryEngine, MetadataSnapshot,
    ReportRequest, SharedEngine,
};
pub use event::{Event, FieldValue};
pub use external::{
    ConfigStore, MemoryConfigStore, MemoryPullerManager, MemoryUidMap, PackageInfo,
    PullAtomCallback, PullAtomMetadata, PullerManager, UidMap,
};
pub use logging::{
    init_logging, LogFormat, LogLevel, LoggingConfig, LoggingError, LOG_FILTER_ENV,
};
pub use pump::{EngineSink, EventIngestionPump, EventSink, LiveSinkSlot, SinkSet};
pub use queue::{EventQueue, QueueError, DEFAULT_EVENT_QUEUE_CAPACITY};
pub use readiness::{
    GateState, ReadinessCallback, ReadinessCondition, ReadinessGate, DEFAULT_INIT_EVENT_DELAY,
};
pub use recovery::{CompanionHolders, RecoveryCoordinator, RecoverySnapshot};
pub use service::{Collaborators, DumpState, ServiceError, TelemetryService};
pub use stats::{DaemonStats, StatsSnapshot, MAX_COMPANION_DEATH_HISTORY};
pub use storage::{
    FileSnapshotStore, MemorySnapshotStore, SnapshotStore, StorageError, StoredReport,
};
pub use subscription::{
    DeliveryReason, SubscriptionCallback, SubscriptionConfig, SubscriptionError, SubscriptionHub,
    SubscriptionId, DEFAULT_SUBSCRIPTION_BUFFER_CAPACITY, MAX_SUBSCRIPTIONS,
};
