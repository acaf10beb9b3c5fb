pub use log::debug;

/// Print a debug message when either the global debug log level or a local debug flag is active
///
/// The local flag is given as the first argument. When it is set the message is printed directly
/// to stderr, so that details for one target, such as a single chromosome, can be traced without
/// turning on debug logging for the whole run.
///
/// # Examples
///
/// ```
/// debug_msg!(false, "Segmenting {}", chrom); // debug log message only with the global --debug flag
/// debug_msg!(true, "Segmenting {}", chrom); // always printed to stderr
/// ```
macro_rules! debug_msg {
    ($flag:expr, $($arg:tt)+) => {
        if $flag {
            eprintln!($($arg)+);
        } else {
            $crate::log_utils::debug!($($arg)+);
        }
    }
}

pub(crate) use debug_msg;
