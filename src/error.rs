/// Boxed application error returned by cleanup hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = DisposeError> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum DisposeError {
    #[error("Cannot access a disposed object: {object}")]
    AlreadyDisposed { object: &'static str },

    #[error("Cannot access an object while it is being disposed: {object}")]
    DisposeInProgress { object: &'static str },

    #[error("Invalid argument '{name}': {message}")]
    InvalidArgument { name: &'static str, message: String },

    #[error("Scope of {scope} disposed out of order (entry depth {depth}, current top depth {top_depth:?})")]
    OutOfOrderDisposal {
        scope: &'static str,
        depth: usize,
        top_depth: Option<usize>,
    },

    #[error("Disposal of {object} failed: {source}")]
    Cleanup {
        object: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("Finalizer of {object} failed: {source}")]
    Finalization {
        object: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("{error} (suppressed: {suppressed})")]
    Suppressed {
        error: Box<DisposeError>,
        suppressed: Box<DisposeError>,
    },
}

impl DisposeError {
    /// True for the two "use after dispose" kinds raised by the lifecycle guards.
    pub fn is_use_after_dispose(&self) -> bool {
        matches!(self, DisposeError::AlreadyDisposed { .. } | DisposeError::DisposeInProgress { .. })
    }

    /// Chains `error` on top of an earlier failure, keeping the earlier one as suppressed.
    pub(crate) fn suppressing(error: DisposeError, previous: Option<DisposeError>) -> DisposeError {
        match previous {
            Some(prev) => DisposeError::Suppressed {
                error: Box::new(error),
                suppressed: Box::new(prev),
            },
            None => error,
        }
    }

    // The primary result wins; a secondary failure is attached as suppressed.
    pub(crate) fn merge(primary: Result<()>, secondary: Result<()>) -> Result<()> {
        match (primary, secondary) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Err(primary), Err(secondary)) => Err(DisposeError::Suppressed {
                error: Box::new(primary),
                suppressed: Box::new(secondary),
            }),
        }
    }
}

impl From<DisposeError> for std::io::Error {
    fn from(err: DisposeError) -> std::io::Error {
        std::io::Error::other(err.to_string())
    }
}

// Wraps a hook error with the name of the object whose cleanup raised it.
#[macro_export]
macro_rules! cleanup_error {
    ($object:expr, $source:expr) => {
        $crate::DisposeError::Cleanup {
            object: $object,
            source: $source.into(),
        }
    };
}
