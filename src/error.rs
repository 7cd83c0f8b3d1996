// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
use std::io;
use thiserror::Error;

/// Result type alias that all rockpool public API functions can use.
pub type Result<T> = std::result::Result<T, RockpoolError>;

#[derive(Error, Debug)]
/// Composite error type to encompass all error types rockpool produces.
///
/// The same type serves two purposes. It is what fallible crate operations
/// return, and it is the "exception" value that travels through the promise
/// exception channel: a handler that fails returns it, a promise stores it,
/// and an exception handler eventually receives it. The
/// [`BrokenPromise`](RockpoolError::BrokenPromise) case is a distinct
/// variant so that it stays matchable among arbitrary user errors.
pub enum RockpoolError {
    /// IO error from standard library functions
    #[error("IO error occurred: {0}")]
    IoError(#[from] io::Error),

    /// A future or promise operation found its shared state already
    /// consumed, e.g. a second completion-handler registration.
    #[error("no shared state")]
    NoState,

    /// Second retrieval of the future for one promise.
    #[error("future already retrieved")]
    FutureAlreadyRetrieved,

    /// The promise already holds a result or an exception.
    #[error("promise already satisfied")]
    PromiseAlreadySatisfied,

    /// The promise was destroyed without ever being resolved.
    #[error("broken promise")]
    BrokenPromise,

    /// The timer id does not (or no longer does) name a registered timer.
    #[error("timer #{id} not found")]
    InvalidTimerId {
        /// raw id of the timer in question
        id: u64,
    },

    /// A user error carried through the promise exception channel.
    #[error("{0}")]
    Other(Box<dyn std::error::Error + 'static>),
}

impl RockpoolError {
    /// Wraps an arbitrary error value so it can travel the promise
    /// exception channel.
    pub fn other(err: impl std::error::Error + 'static) -> RockpoolError {
        RockpoolError::Other(Box::new(err))
    }

    /// True iff this is the distinguished broken-promise error.
    pub fn is_broken_promise(&self) -> bool {
        matches!(self, RockpoolError::BrokenPromise)
    }
}
