// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
use std::rc::Rc;

use crate::{
    error::{Result, RockpoolError},
    future::{Future, Promise},
};

/// Starts a chain of dependent asynchronous operations.
///
/// Shorthand for `ChainedFuture::new(future).then(handler)`; see
/// [`ChainedFuture`].
pub fn chain<T, R, H>(future: Future<T>, handler: H) -> ChainedFuture<R>
where
    T: 'static,
    R: 'static,
    H: FnOnce(T) -> Result<Future<R>> + 'static,
{
    ChainedFuture::new(future).then(handler)
}

/// A future wrapper that sequences dependent operations.
///
/// Each [`then`](ChainedFuture::then) stage maps the previous stage's
/// result to the next future; [`done`](ChainedFuture::done) takes the
/// terminal stage, and [`catch`](ChainedFuture::catch) (or
/// [`EndChainedFuture::catch`]) attaches the single error handler. Every
/// error in the chain reaches that handler exactly once, whether it came
/// from an upstream future, from a stage handler failing synchronously,
/// or from the future a stage handler returned. A chain without a `catch`
/// loses errors silently, so always finish with one.
///
/// # Examples
///
/// ```
/// use std::{cell::Cell, rc::Rc};
/// use rockpool::{
///     future::{chain, Promise},
///     Reactor,
/// };
///
/// let reactor = Reactor::new();
/// let first = Promise::new(&reactor);
/// let second = Promise::<()>::new(&reactor);
///
/// let sum = Rc::new(Cell::new(0));
/// let seen = Rc::clone(&sum);
/// let second_future = second.take_future().unwrap();
/// chain(first.take_future().unwrap(), move |value: i32| {
///     seen.set(value);
///     Ok(second_future)
/// })
/// .done(|()| Ok(()))
/// .catch(|_exception| Ok(()));
///
/// first.set_value(7).unwrap();
/// second.set_value(()).unwrap();
/// reactor.run().unwrap();
/// assert_eq!(sum.get(), 7);
/// ```
pub struct ChainedFuture<T: 'static> {
    future: Future<T>,
}

impl<T: 'static> ChainedFuture<T> {
    /// Wraps a valid future so stages can be chained onto it.
    pub fn new(future: Future<T>) -> ChainedFuture<T> {
        assert!(future.is_valid(), "a chain must start from a valid future");
        ChainedFuture { future }
    }

    /// Appends a stage mapping this chain's result to the next future.
    ///
    /// The handler runs when the current stage resolves successfully; an
    /// upstream error skips it and flows on toward the terminal handler.
    pub fn then<R, H>(mut self, handler: H) -> ChainedFuture<R>
    where
        R: 'static,
        H: FnOnce(T) -> Result<Future<R>> + 'static,
    {
        let promise = Rc::new(Promise::<R>::new(self.future.reactor()));
        let future = promise.take_future().unwrap();

        let on_result = {
            let promise = Rc::clone(&promise);
            move |result: T| match handler(result) {
                Ok(inner) => forward(inner, &promise),
                Err(exception) => promise.set_exception(exception),
            }
        };
        let on_exception = move |exception| promise.set_exception(exception);
        self.future
            .on_completion_or_else(on_result, on_exception)
            .unwrap();
        ChainedFuture { future }
    }

    /// Appends the terminal stage, which consumes the final result.
    pub fn done<H>(mut self, handler: H) -> EndChainedFuture
    where
        H: FnOnce(T) -> Result<()> + 'static,
    {
        let promise = Rc::new(Promise::<()>::new(self.future.reactor()));
        let future = promise.take_future().unwrap();

        let on_result = {
            let promise = Rc::clone(&promise);
            move |result: T| match handler(result) {
                Ok(()) => promise.set_value(()),
                Err(exception) => promise.set_exception(exception),
            }
        };
        let on_exception = move |exception| promise.set_exception(exception);
        self.future
            .on_completion_or_else(on_result, on_exception)
            .unwrap();
        EndChainedFuture { future }
    }

    /// Terminates the chain with its error handler, discarding any
    /// successful result.
    pub fn catch<H>(mut self, handler: H)
    where
        H: FnOnce(RockpoolError) -> Result<()> + 'static,
    {
        self.future
            .on_completion_or_else(|_| Ok(()), handler)
            .unwrap();
    }
}

// Routes the resolution of the future a stage handler returned into the
// hidden promise that drives the next stage.
fn forward<R: 'static>(mut inner: Future<R>, promise: &Rc<Promise<R>>) -> Result<()> {
    let on_result = {
        let promise = Rc::clone(promise);
        move |result| promise.set_value(result)
    };
    let on_exception = {
        let promise = Rc::clone(promise);
        move |exception| promise.set_exception(exception)
    };
    inner.on_completion_or_else(on_result, on_exception)
}

/// A fully-applied chain, waiting only for its error handler.
pub struct EndChainedFuture {
    future: Future<()>,
}

impl EndChainedFuture {
    /// Attaches the chain's single error handler.
    pub fn catch<H>(mut self, handler: H)
    where
        H: FnOnce(RockpoolError) -> Result<()> + 'static,
    {
        self.future
            .on_completion_or_else(|()| Ok(()), handler)
            .unwrap();
    }
}
