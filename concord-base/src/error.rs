// Errors in a replica cluster split two ways. At startup everything is
// fatal: a configuration naming an unknown consistency level, a peer port
// that will not bind, a peer that never shows up within the connect
// window. Once a replica is serving, almost nothing is: a malformed peer
// message is logged and dropped (its acknowledgement count just never
// completes), a disconnected client costs only its own pending reply, and
// the replica keeps applying proposals.
//
// Both paths want the same two things from the error type. A backtrace
// from the point of creation, because the interesting frame is usually a
// reactor loop several calls above whatever serde or io call actually
// failed. And an announcement into the tracing system the moment the
// error exists, so a replica that dropped something leaves a record even
// though it kept running — and so one breakpoint here traps every error
// in the system soon after it is made.

use std::borrow::Cow;
use std::fmt;

use backtrace_error::DynBacktraceError;
use tracing::error;

#[derive(Debug)]
#[allow(dead_code)]
pub struct Error(DynBacktraceError);
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new<E: std::error::Error + Send + Sync + 'static>(cause: E) -> Error {
        error!(target: "concord", "{cause}");
        Error(DynBacktraceError::from(cause))
    }
}

// Everything foreign converts at the boundary it crosses, so `?` works on
// io, serde, channel, and thread-spawn failures alike.
impl<E: std::error::Error + Send + Sync + 'static> From<E> for Error {
    fn from(cause: E) -> Error {
        Error::new(cause)
    }
}

// Protocol-level failures have no foreign cause to wrap: a sleep request
// arriving on the wire, an ack with no msg_timestamp to name its propose,
// a client index the configuration never defined. Those become errors by
// stating what went wrong.
pub fn err(msg: impl Into<Cow<'static, str>>) -> Error {
    struct Reason(Cow<'static, str>);
    impl fmt::Display for Reason {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }
    impl fmt::Debug for Reason {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            fmt::Display::fmt(self, f)
        }
    }
    impl std::error::Error for Reason {}
    Error::new(Reason(msg.into()))
}

#[cfg(test)]
mod test {
    use super::{err, Result};
    use test_log::test;

    #[test]
    fn test_stated_errors() {
        let _err = err("ack message missing msg_timestamp");
        let _err = err(format!("no ports configured for replica {}", 3));
    }

    #[test]
    fn test_foreign_errors_convert() {
        fn stamp_of(text: &str) -> Result<u64> {
            Ok(text.parse::<u64>()?)
        }
        assert_eq!(stamp_of("17").unwrap(), 17);
        assert!(stamp_of("seventeen").is_err());
    }
}
