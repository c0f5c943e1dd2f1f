/// Installs the process-wide log sinks (stdout + timestamped file).
pub mod logger;
