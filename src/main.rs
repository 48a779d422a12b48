use std::process;

fn main() {
    if let Err(err) = telemd::app::run() {
        eprintln!("fatal: {err:#}");
        process::exit(1);
    }
}
