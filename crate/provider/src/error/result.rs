use std::fmt::Display;

use crate::error::HError;

pub type HResult<R> = Result<R, HError>;

pub trait HResultHelper<T> {
    fn context(self, context: &str) -> HResult<T>;
    fn with_context<D, O>(self, op: O) -> HResult<T>
    where
        D: Display + Send + Sync + 'static,
        O: FnOnce() -> D;
}

impl<T, E> HResultHelper<T> for Result<T, E>
where
    E: std::error::Error,
{
    fn context(self, context: &str) -> HResult<T> {
        self.map_err(|e| HError::Default(format!("{context}: {e}")))
    }

    fn with_context<D, O>(self, op: O) -> HResult<T>
    where
        D: Display + Send + Sync + 'static,
        O: FnOnce() -> D,
    {
        self.map_err(|e| HError::Default(format!("{}: {e}", op())))
    }
}

impl<T> HResultHelper<T> for Option<T> {
    fn context(self, context: &str) -> HResult<T> {
        self.ok_or_else(|| HError::Default(context.to_owned()))
    }

    fn with_context<D, O>(self, op: O) -> HResult<T>
    where
        D: Display + Send + Sync + 'static,
        O: FnOnce() -> D,
    {
        self.ok_or_else(|| HError::Default(format!("{}", op())))
    }
}
