//! Error types for the controller core.
//!
//! The controller uses an errno-style encoding on its outer surface:
//! non-negative return values are successes (and carry sizes where
//! applicable), negative values are errors. Three error kinds matter to
//! callers: [`Error::EINVAL`] (caller-side precondition violation),
//! [`Error::EAGAIN`] (transient state, retry after the next notification) and
//! [`Error::EOPNOTSUPP`] (configuration this build does not implement).
use core::num::NonZeroI32;

/// An errno-style return value.
///
/// Can be converted to a `Result` to check for success or an error.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RetVal(i32);

impl RetVal {
    /// A successful return value.
    pub const SUCCESS: RetVal = RetVal(0);

    /// Create a new `RetVal` from an integer.
    pub const fn new(n: i32) -> Self {
        RetVal(n)
    }

    /// Convert the `RetVal` to a `Result`.
    ///
    /// Non-negative values are considered success, and are returned as `Ok(value)`.
    /// Negative values are considered errors, and are returned as `Err(Error)`.
    pub const fn to_result(self) -> Result<u32, Error> {
        if self.0 >= 0 {
            Ok(self.0 as u32)
        } else {
            Err(Error(unsafe { NonZeroI32::new_unchecked(self.0) }))
        }
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for RetVal {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::Format::format(&self.to_result(), fmt)
    }
}

impl core::fmt::Debug for RetVal {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Debug::fmt(&self.to_result(), f)
    }
}

impl From<i32> for RetVal {
    fn from(value: i32) -> Self {
        RetVal(value)
    }
}

impl From<RetVal> for i32 {
    fn from(value: RetVal) -> Self {
        value.0
    }
}

impl<T> From<Result<T, Error>> for RetVal
where
    T: Into<i32>,
{
    fn from(value: Result<T, Error>) -> Self {
        match value {
            Ok(n) => RetVal(n.into()),
            Err(e) => e.to_retval(),
        }
    }
}

/// An error returned from the controller APIs.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Error(NonZeroI32);

impl Error {
    const unsafe fn from_errno(err: u32) -> Error {
        Error(NonZeroI32::new_unchecked(-(err as i32)))
    }

    /// Convert an `Error` to a `RetVal`.
    pub const fn to_retval(self) -> RetVal {
        RetVal(self.0.get())
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Debug::fmt(self, f)
    }
}

impl core::error::Error for Error {}

impl embedded_io::Error for Error {
    fn kind(&self) -> embedded_io::ErrorKind {
        embedded_io::ErrorKind::Other
    }
}

impl From<Error> for i32 {
    fn from(value: Error) -> Self {
        value.0.get()
    }
}

macro_rules! errnos {
    (
        $(
            $(#[$docs:meta])*
            ($konst:ident, $name:expr, $num:expr);
        )+
    ) => {
        impl Error {
        $(
            $(#[$docs])*
            pub const $konst: Error = unsafe { Error::from_errno($num) };
        )+
        }

        impl RetVal {
        $(
            $(#[$docs])*
            pub const $konst: RetVal = Error::$konst.to_retval();
        )+
        }

        #[cfg(feature = "defmt")]
        impl defmt::Format for Error {
            fn format(&self, fmt: defmt::Formatter) {
                match *self {
                    $(
                    Self::$konst => defmt::write!(fmt, $name),
                    )+
                    _ => defmt::write!(fmt, "Unknown errno: {}", self.0),
                }
            }
        }

        impl core::fmt::Debug for Error {
            fn fmt(&self, fmt: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                match *self {
                    $(
                    Self::$konst => core::write!(fmt, $name),
                    )+
                    _ => core::write!(fmt, "Unknown errno: {}", self.0),
                }
            }
        }
    }
}

errnos! {
    /// Operation not permitted.
    (EPERM, "EPERM", 1);
    /// No such entity.
    (ENOENT, "ENOENT", 2);
    /// I/O error.
    (EIO, "EIO", 5);
    /// Out of memory.
    (ENOMEM, "ENOMEM", 12);
    /// Bad address.
    (EFAULT, "EFAULT", 14);
    /// Invalid argument.
    (EINVAL, "EINVAL", 22);
    /// Try again.
    (EAGAIN, "EAGAIN", 35);
    /// Operation not supported.
    (EOPNOTSUPP, "EOPNOTSUPP", 45);
    /// Operation timed out.
    (ETIMEDOUT, "ETIMEDOUT", 60);
    /// No buffer space available.
    (ENOBUFS, "ENOBUFS", 105);
    /// Operation now in progress.
    (EINPROGRESS, "EINPROGRESS", 115);
    /// Operation canceled.
    (ECANCELED, "ECANCELED", 125);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retval_roundtrip() {
        assert_eq!(RetVal::new(0).to_result(), Ok(0));
        assert_eq!(RetVal::new(1184).to_result(), Ok(1184));
        assert_eq!(RetVal::new(-22).to_result(), Err(Error::EINVAL));
        assert_eq!(Error::EAGAIN.to_retval(), RetVal::new(-35));
    }

    #[test]
    fn error_kinds_are_distinct() {
        assert_ne!(Error::EINVAL, Error::EAGAIN);
        assert_ne!(Error::EAGAIN, Error::EOPNOTSUPP);
    }
}
