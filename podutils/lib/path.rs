//! `podutils::path` is a module containing path constants for the podcore project.

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The suffix used for log files.
pub const LOG_SUFFIX: &str = "log";

/// The filename of the supervisor's own log file.
pub const SUPERVISOR_LOG_FILENAME: &str = "supervisor.log";

/// The extension given to a rotated-out log file.
pub const ROTATED_LOG_EXTENSION: &str = "old";
