// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! Push-style deferred results bound to a [`Reactor`].
//!
//! A [`Promise`] is the write end and a [`Future`] the read end of a
//! one-shot result-or-error cell. Unlike `std::future`, which is pulled
//! by an executor, this pair pushes: resolving the promise schedules the
//! future's completion handler as an immediate event on the associated
//! reactor. The handler therefore never runs synchronously from within
//! [`Promise::set_value`] or [`Future::on_completion`]; one
//! [`Reactor::run`] dispatch pass is always required before the side
//! effects become observable.
//!
//! [`chain`] sequences dependent futures with one terminal error handler,
//! and [`when_all`] gathers a batch of futures into a single one.
//!
//! None of these types are thread-safe; they live on the reactor's
//! thread.

use std::{cell::RefCell, fmt, rc::Rc};

use log::debug;

use crate::{
    error::{Result, RockpoolError},
    reactor::Reactor,
};

mod chain;
mod when_all;

pub use self::chain::{chain, ChainedFuture, EndChainedFuture};
pub use self::when_all::{when_all, AnyResult};

type ResultHandler<T> = Box<dyn FnOnce(T) -> Result<()>>;
type ExceptionHandler = Box<dyn FnOnce(RockpoolError) -> Result<()>>;

struct State<T> {
    future_retrieved: bool,
    result_retrieved: bool,
    result_handler: Option<ResultHandler<T>>,
    exception_handler: Option<ExceptionHandler>,
    result: Option<T>,
    exception: Option<RockpoolError>,
}

impl<T> State<T> {
    // Delivery moves the stored result or exception out, so a bare
    // `result`/`exception` check is not enough once a handler has run.
    fn satisfied(&self) -> bool {
        self.result.is_some() || self.exception.is_some() || self.result_retrieved
    }
}

// The shared state of one promise/future pair. The promise, the future
// and any scheduled delivery closure each hold a strong reference; the
// last of them to go away (which may well be an enqueued closure that
// outlived both endpoints) tears the state down.
struct Shared<T> {
    reactor: Reactor,
    state: RefCell<State<T>>,
}

fn schedule_result<T: 'static>(shared: &Rc<Shared<T>>) {
    let shared = Rc::clone(shared);
    let reactor = shared.reactor.clone();
    reactor.add_immediate_event(move |_| {
        let (handler, result) = {
            let mut state = shared.state.borrow_mut();
            state.result_retrieved = true;
            (
                state.result_handler.take().unwrap(),
                state.result.take().unwrap(),
            )
        };
        handler(result)
    });
}

fn schedule_exception<T: 'static>(shared: &Rc<Shared<T>>) {
    let shared = Rc::clone(shared);
    let reactor = shared.reactor.clone();
    reactor.add_immediate_event(move |_| {
        let (handler, exception) = {
            let mut state = shared.state.borrow_mut();
            state.result_retrieved = true;
            (
                state.exception_handler.take().unwrap(),
                state.exception.take().unwrap(),
            )
        };
        handler(exception)
    });
}

fn store_exception<T: 'static>(shared: &Rc<Shared<T>>, exception: RockpoolError) -> Result<()> {
    {
        let mut state = shared.state.borrow_mut();
        if state.satisfied() {
            return Err(RockpoolError::PromiseAlreadySatisfied);
        }
        state.exception = Some(exception);
        if state.exception_handler.is_none() {
            return Ok(());
        }
    }
    schedule_exception(shared);
    Ok(())
}

/// The write end of a one-shot deferred result.
///
/// A `Promise` is created against a [`Reactor`], hands out its single
/// [`Future`] through [`take_future`](Promise::take_future), and is
/// resolved exactly once with [`set_value`](Promise::set_value) or
/// [`set_exception`](Promise::set_exception). Dropping a promise that was
/// never resolved delivers the distinguished
/// [broken promise](RockpoolError::BrokenPromise) error instead, so a
/// forgotten promise cannot silently strand its consumer.
///
/// The reactor must outlive the promise and anything scheduled through
/// it.
///
/// # Examples
///
/// ```
/// use rockpool::{future::Promise, Reactor};
///
/// let reactor = Reactor::new();
/// let promise = Promise::new(&reactor);
/// let mut future = promise.take_future().unwrap();
/// future
///     .on_completion(|value: i32| {
///         assert_eq!(value, 123);
///         Ok(())
///     })
///     .unwrap();
///
/// promise.set_value(123).unwrap();
/// reactor.run().unwrap();
/// ```
pub struct Promise<T: 'static> {
    shared: Rc<Shared<T>>,
}

impl<T: 'static> Promise<T> {
    /// Creates a promise whose handlers will be dispatched by `reactor`.
    pub fn new(reactor: &Reactor) -> Promise<T> {
        Promise {
            shared: Rc::new(Shared {
                reactor: reactor.clone(),
                state: RefCell::new(State {
                    future_retrieved: false,
                    result_retrieved: false,
                    result_handler: None,
                    exception_handler: None,
                    result: None,
                    exception: None,
                }),
            }),
        }
    }

    /// Returns the [`Future`] sharing state with this promise.
    ///
    /// There is only one: a second call fails with
    /// [`RockpoolError::FutureAlreadyRetrieved`].
    pub fn take_future(&self) -> Result<Future<T>> {
        {
            let mut state = self.shared.state.borrow_mut();
            if state.future_retrieved {
                return Err(RockpoolError::FutureAlreadyRetrieved);
            }
            state.future_retrieved = true;
        }
        Ok(Future {
            shared: Some(Rc::clone(&self.shared)),
        })
    }

    /// Stores the result.
    ///
    /// If a result handler is registered, its invocation is scheduled on
    /// the reactor; it never runs from inside this call. Fails with
    /// [`RockpoolError::PromiseAlreadySatisfied`] if the promise was
    /// already resolved.
    pub fn set_value(&self, result: T) -> Result<()> {
        {
            let mut state = self.shared.state.borrow_mut();
            if state.satisfied() {
                return Err(RockpoolError::PromiseAlreadySatisfied);
            }
            state.result = Some(result);
            if state.result_handler.is_none() {
                return Ok(());
            }
        }
        schedule_result(&self.shared);
        Ok(())
    }

    /// Stores an exception instead of a result.
    pub fn set_exception(&self, exception: RockpoolError) -> Result<()> {
        store_exception(&self.shared, exception)
    }
}

impl<T: 'static> Drop for Promise<T> {
    fn drop(&mut self) {
        let unresolved = {
            let state = self.shared.state.borrow();
            !state.satisfied()
        };
        if unresolved {
            debug!("promise dropped before resolution, delivering a broken promise");
            let _ = store_exception(&self.shared, RockpoolError::BrokenPromise);
        }
    }
}

impl<T: 'static> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Promise { .. }")
    }
}

/// The read end of a one-shot deferred result.
///
/// Obtained from [`Promise::take_future`]. The owner registers a result
/// handler (and optionally an exception handler) once; delivery happens
/// through the reactor at the next dispatch pass after resolution,
/// whichever of attach and resolve happened first.
pub struct Future<T: 'static> {
    shared: Option<Rc<Shared<T>>>,
}

impl<T: 'static> Future<T> {
    /// Whether handlers can still be attached.
    ///
    /// True iff this future shares state with a promise and
    /// [`on_completion`](Future::on_completion) has not been called yet.
    pub fn is_valid(&self) -> bool {
        self.shared.is_some()
    }

    /// The [`Reactor`] this future delivers through.
    pub fn reactor(&self) -> &Reactor {
        &self
            .shared
            .as_ref()
            .expect("the future no longer has shared state")
            .reactor
    }

    /// Registers the result handler; errors are re-raised.
    ///
    /// Equivalent to [`on_completion_or_else`](Future::on_completion_or_else)
    /// with an exception handler that returns the error again, which
    /// makes it propagate out of [`Reactor::run`].
    pub fn on_completion<R>(&mut self, result_handler: R) -> Result<()>
    where
        R: FnOnce(T) -> Result<()> + 'static,
    {
        self.on_completion_or_else(result_handler, |exception| Err(exception))
    }

    /// Registers the callbacks invoked when a result is ready or an error
    /// occurred.
    ///
    /// If the shared state already holds a result or an exception, the
    /// matching handler is scheduled on the reactor right away; otherwise
    /// the handlers are stored and scheduled upon resolution, which may
    /// happen after this `Future` has been dropped. Exactly one of the
    /// two handlers will ever run, and at most once.
    ///
    /// Consumes the future's validity; a second registration fails with
    /// [`RockpoolError::NoState`].
    pub fn on_completion_or_else<R, E>(&mut self, result_handler: R, exception_handler: E) -> Result<()>
    where
        R: FnOnce(T) -> Result<()> + 'static,
        E: FnOnce(RockpoolError) -> Result<()> + 'static,
    {
        let shared = self.shared.take().ok_or(RockpoolError::NoState)?;
        let resolved = {
            let mut state = shared.state.borrow_mut();
            state.result_handler = Some(Box::new(result_handler));
            state.exception_handler = Some(Box::new(exception_handler));
            if state.result.is_some() {
                Some(true)
            } else if state.exception.is_some() {
                Some(false)
            } else {
                None
            }
        };
        match resolved {
            Some(true) => schedule_result(&shared),
            Some(false) => schedule_exception(&shared),
            None => {}
        }
        Ok(())
    }
}

impl<T: 'static> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Future { .. }")
    }
}
