// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
use std::{
    cell::{Cell, RefCell},
    collections::{BTreeMap, VecDeque},
    fmt,
    os::unix::io::RawFd,
    rc::Rc,
    time::{Duration, Instant},
};

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::{
    clock::{Clock, MonotonicClock},
    error::{Result, RockpoolError},
    poller::{PollEntry, Poller, SysPoller},
};

/// Identifies a timer registration.
///
/// Ids are process-unique and stable for the whole lifetime of the timer.
/// An id stays usable as a lookup key after its timer has expired or been
/// removed; such lookups fail cleanly with
/// [`RockpoolError::InvalidTimerId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// How many times a timer fires before it removes itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    /// Fire a fixed number of times. `Times(0)` registers a timer that
    /// never fires; the returned id is already expired.
    Times(u64),
    /// Fire until the timer is removed or the reactor stops.
    Forever,
}

/// Handler invoked when a watched socket becomes read-ready.
pub type SocketHandler = Box<dyn FnMut(&Reactor, RawFd) -> Result<()>>;

/// Handler invoked when a timer fires.
pub type TimerHandler = Box<dyn FnMut(&Reactor, TimerId) -> Result<()>>;

/// One-shot handler queued with [`Reactor::add_immediate_event`].
pub type EventHandler = Box<dyn FnOnce(&Reactor) -> Result<()>>;

struct SocketEntry {
    fd: RawFd,
    // Removal from inside a dispatch pass only tombstones the entry; the
    // actual sweep is deferred to the next rebuild of the poll set.
    live: bool,
    handler: Rc<RefCell<SocketHandler>>,
}

struct TimerEntry {
    interval: Duration,
    remaining: Repeat,
    next_fire: Instant,
    handler: Rc<RefCell<TimerHandler>>,
}

struct Timers {
    next_id: u64,
    by_id: AHashMap<u64, TimerEntry>,

    /// Registered timers in the order in which they fire. The `u64` is
    /// the timer id, which breaks ties between timers due at the same
    /// instant: lower ids fire first.
    deadlines: BTreeMap<(Instant, u64), ()>,
}

impl Timers {
    fn new() -> Timers {
        Timers {
            next_id: 0,
            by_id: AHashMap::new(),
            deadlines: BTreeMap::new(),
        }
    }
}

struct Inner {
    sockets: RefCell<Vec<SocketEntry>>,
    poll_set: RefCell<Vec<PollEntry>>,
    needs_rebuild: Cell<bool>,
    timers: RefCell<Timers>,
    immediates: RefCell<VecDeque<EventHandler>>,
    running: Cell<bool>,
    stop_requested: Cell<bool>,
    poller: RefCell<Box<dyn Poller>>,
    clock: Box<dyn Clock>,
}

/// An implementation of the reactor pattern.
///
/// The reactor polls a number of sockets, and when a socket has incoming
/// data it dispatches to the handler function(s) registered for that
/// socket. If multiple sockets are ready, or there are multiple handlers
/// for one socket, the handlers are called in the order they were added.
///
/// It also supports timed events, where a handler is called a certain
/// number of times (or indefinitely) with a fixed interval, and immediate
/// events, which run once at the start of the next dispatch pass. Timers
/// are only active while the loop is running: [`run`](Reactor::run)
/// re-aligns every timer's deadline on entry, so the first fire lands
/// `interval` after `run` starts.
///
/// `Reactor` is a cheap handle over shared single-threaded state; cloning
/// it clones the handle, not the reactor. Every method takes `&self`, so
/// handlers (which receive the reactor as their first argument) can add
/// and remove registrations freely while they run, including their own.
///
/// # Examples
///
/// ```
/// use std::{cell::Cell, rc::Rc, time::Duration};
/// use rockpool::{Reactor, Repeat};
///
/// let reactor = Reactor::new();
/// let fired = Rc::new(Cell::new(0));
/// let counter = Rc::clone(&fired);
/// reactor.add_timer(Duration::from_millis(2), Repeat::Times(3), move |_, _| {
///     counter.set(counter.get() + 1);
///     Ok(())
/// });
///
/// // `run` returns once nothing is left that could fire.
/// reactor.run().unwrap();
/// assert_eq!(fired.get(), 3);
/// ```
#[derive(Clone)]
pub struct Reactor {
    inner: Rc<Inner>,
}

impl Reactor {
    /// Creates a reactor over the production poller and clock.
    pub fn new() -> Reactor {
        Reactor::with_parts(Box::new(SysPoller::new()), Box::new(MonotonicClock))
    }

    /// Creates a reactor over a caller-supplied [`Poller`] and [`Clock`].
    ///
    /// This is the seam deterministic tests use: a manual clock plus a
    /// scripted poller make every dispatch decision reproducible.
    pub fn with_parts(poller: Box<dyn Poller>, clock: Box<dyn Clock>) -> Reactor {
        Reactor {
            inner: Rc::new(Inner {
                sockets: RefCell::new(Vec::new()),
                poll_set: RefCell::new(Vec::new()),
                needs_rebuild: Cell::new(false),
                timers: RefCell::new(Timers::new()),
                immediates: RefCell::new(VecDeque::new()),
                running: Cell::new(false),
                stop_requested: Cell::new(false),
                poller: RefCell::new(poller),
                clock,
            }),
        }
    }

    /// Adds a handler for the given socket.
    ///
    /// The handler is invoked once per readiness observation and receives
    /// the reactor and the socket handle. Several handlers may be
    /// registered against the same handle; they fire in registration
    /// order. Readiness may be spurious, so a handler must tolerate a
    /// zero-byte read.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::os::unix::{io::AsRawFd, net::UnixDatagram};
    /// use rockpool::Reactor;
    ///
    /// let (tx, rx) = UnixDatagram::pair().unwrap();
    /// tx.send(b"ping").unwrap();
    ///
    /// let reactor = Reactor::new();
    /// reactor.add_socket(rx.as_raw_fd(), move |reactor, _fd| {
    ///     let mut buf = [0u8; 16];
    ///     rx.recv(&mut buf)?;
    ///     reactor.stop();
    ///     Ok(())
    /// });
    /// reactor.run().unwrap();
    /// ```
    pub fn add_socket(
        &self,
        fd: RawFd,
        handler: impl FnMut(&Reactor, RawFd) -> Result<()> + 'static,
    ) {
        self.inner.sockets.borrow_mut().push(SocketEntry {
            fd,
            live: true,
            handler: Rc::new(RefCell::new(Box::new(handler))),
        });
        self.inner.needs_rebuild.set(true);
    }

    /// Removes all handlers for the given socket.
    ///
    /// If this is called from inside a socket handler, no more handlers
    /// will be called for the removed socket, even if the last poll
    /// reported it ready. Removing a socket that was never registered
    /// does nothing.
    pub fn remove_socket(&self, fd: RawFd) {
        for entry in self.inner.sockets.borrow_mut().iter_mut() {
            if entry.fd == fd {
                entry.live = false;
            }
        }
        self.inner.needs_rebuild.set(true);
    }

    /// Adds a timer.
    ///
    /// The first event fires `interval` after [`run`](Reactor::run)
    /// starts (or after this call, when the loop is already running), and
    /// subsequent deadlines advance by `interval` from the previous
    /// deadline rather than from the time the handler actually ran, so
    /// the cadence does not drift. The handler receives the reactor and
    /// the returned id.
    pub fn add_timer(
        &self,
        interval: Duration,
        count: Repeat,
        handler: impl FnMut(&Reactor, TimerId) -> Result<()> + 'static,
    ) -> TimerId {
        let timers = &mut *self.inner.timers.borrow_mut();
        timers.next_id += 1;
        let id = TimerId(timers.next_id);
        if count == Repeat::Times(0) {
            return id;
        }
        let next_fire = self.inner.clock.now() + interval;
        timers.by_id.insert(
            id.0,
            TimerEntry {
                interval,
                remaining: count,
                next_fire,
                handler: Rc::new(RefCell::new(Box::new(handler))),
            },
        );
        timers.deadlines.insert((next_fire, id.0), ());
        id
    }

    /// Removes a timer.
    ///
    /// Called from the timer's own handler, this cancels all future
    /// fires. A stale id fails with [`RockpoolError::InvalidTimerId`]
    /// without corrupting any state.
    pub fn remove_timer(&self, id: TimerId) -> Result<()> {
        let timers = &mut *self.inner.timers.borrow_mut();
        match timers.by_id.remove(&id.0) {
            Some(entry) => {
                timers.deadlines.remove(&(entry.next_fire, id.0));
                Ok(())
            }
            None => Err(RockpoolError::InvalidTimerId { id: id.0 }),
        }
    }

    /// Resets the time to the next event for a timer.
    ///
    /// The timer's next deadline becomes `now + interval`; the number of
    /// remaining events, the interval and the handler are unchanged. This
    /// re-aligns a periodic timer after an external event, and works on
    /// the timer currently being dispatched: its next fire is then
    /// scheduled from now instead of advancing from the old deadline.
    pub fn restart_timer_interval(&self, id: TimerId) -> Result<()> {
        let now = self.inner.clock.now();
        let timers = &mut *self.inner.timers.borrow_mut();
        let entry = timers
            .by_id
            .get_mut(&id.0)
            .ok_or(RockpoolError::InvalidTimerId { id: id.0 })?;
        let old_key = (entry.next_fire, id.0);
        entry.next_fire = now + entry.interval;
        let new_key = (entry.next_fire, id.0);
        timers.deadlines.remove(&old_key);
        timers.deadlines.insert(new_key, ());
        Ok(())
    }

    /// Schedules a one-shot event for the earliest point of the next
    /// dispatch pass, before the reactor re-enters the poller.
    ///
    /// Immediate events run in FIFO order, and an event queued while the
    /// queue is being drained still runs in the same pass.
    pub fn add_immediate_event(&self, handler: impl FnOnce(&Reactor) -> Result<()> + 'static) {
        self.inner
            .immediates
            .borrow_mut()
            .push_back(Box::new(handler));
    }

    /// Runs the dispatch loop.
    ///
    /// Returns when [`stop`](Reactor::stop) is called (by one of the
    /// handlers, or beforehand) or when no sockets, timers or immediate
    /// events are left to wait on. An error returned by any handler stops
    /// the loop and propagates out of `run`, with every registration left
    /// intact; a subsequent `run` picks up where things stood.
    pub fn run(&self) -> Result<()> {
        assert!(!self.inner.running.get(), "the reactor is already running");
        self.align_timers();
        self.inner.running.set(true);
        let _running = RunningGuard(&self.inner.running);

        loop {
            if self.inner.stop_requested.take() {
                return Ok(());
            }

            loop {
                let event = self.inner.immediates.borrow_mut().pop_front();
                let event = match event {
                    Some(event) => event,
                    None => break,
                };
                event(self)?;
                if self.inner.stop_requested.take() {
                    return Ok(());
                }
            }

            if self.inner.needs_rebuild.take() {
                self.rebuild();
            }
            if self.inner.poll_set.borrow().is_empty() && self.inner.timers.borrow().by_id.is_empty()
            {
                return Ok(());
            }

            // Handlers may register more sockets below; those become part
            // of the poll set at the next rebuild and must not be touched
            // by the current pass.
            let socket_count = self.inner.poll_set.borrow().len();
            let wait = self.time_to_next_event();
            {
                let mut poll_set = self.inner.poll_set.borrow_mut();
                let mut poller = self.inner.poller.borrow_mut();
                poller.poll(&mut poll_set, wait)?;
            }

            self.dispatch_timers()?;
            if self.inner.stop_requested.take() {
                return Ok(());
            }
            self.dispatch_sockets(socket_count)?;
            if self.inner.stop_requested.take() {
                return Ok(());
            }
        }
    }

    /// Stops the dispatch loop.
    ///
    /// May be called from inside any handler; the loop returns once that
    /// handler finishes. Called while the reactor is idle, it makes the
    /// next [`run`](Reactor::run) return immediately.
    pub fn stop(&self) {
        self.inner.stop_requested.set(true);
    }

    // Timers are only live while the loop runs: entering it schedules
    // every timer `interval` from now.
    fn align_timers(&self) {
        let now = self.inner.clock.now();
        let timers = &mut *self.inner.timers.borrow_mut();
        timers.deadlines.clear();
        for (&id, entry) in timers.by_id.iter_mut() {
            entry.next_fire = now + entry.interval;
            timers.deadlines.insert((entry.next_fire, id), ());
        }
    }

    fn rebuild(&self) {
        let mut sockets = self.inner.sockets.borrow_mut();
        sockets.retain(|entry| entry.live);
        let mut poll_set = self.inner.poll_set.borrow_mut();
        poll_set.clear();
        poll_set.extend(sockets.iter().map(|entry| PollEntry::readable(entry.fd)));
    }

    fn time_to_next_event(&self) -> Option<Duration> {
        let timers = self.inner.timers.borrow();
        let &(deadline, _) = timers.deadlines.keys().next()?;
        Some(deadline.saturating_duration_since(self.inner.clock.now()))
    }

    fn dispatch_timers(&self) -> Result<()> {
        let now = self.inner.clock.now();

        // Snapshot the due set up front. Timers registered by the
        // handlers below can never join it, so they fire no earlier than
        // the next pass.
        let due: SmallVec<[(Instant, u64); 8]> = {
            let timers = &mut *self.inner.timers.borrow_mut();
            let due: SmallVec<[(Instant, u64); 8]> = timers
                .deadlines
                .range(..=(now, u64::MAX))
                .map(|(&key, _)| key)
                .collect();
            for key in &due {
                timers.deadlines.remove(key);
            }
            due
        };

        for (index, &(deadline, id)) in due.iter().enumerate() {
            let result = self.fire_timer(deadline, id);
            if result.is_err() || self.inner.stop_requested.get() {
                self.requeue_due(&due[index + 1..]);
                return result;
            }
        }
        Ok(())
    }

    fn fire_timer(&self, deadline: Instant, id: u64) -> Result<()> {
        let handler = {
            let timers = self.inner.timers.borrow();
            match timers.by_id.get(&id) {
                // A deadline that moved since the snapshot means the
                // timer was restarted by an earlier handler in this pass;
                // it is no longer due.
                Some(entry) if entry.next_fire == deadline => Rc::clone(&entry.handler),
                _ => return Ok(()),
            }
        };

        let result = (*handler.borrow_mut())(self, TimerId(id));

        // Bookkeeping happens even when the handler failed, so that an
        // error propagating out of `run` leaves the timer in a coherent
        // state.
        let timers = &mut *self.inner.timers.borrow_mut();
        if let Some(entry) = timers.by_id.get_mut(&id) {
            let expired = match &mut entry.remaining {
                Repeat::Times(count) => {
                    *count -= 1;
                    *count == 0
                }
                Repeat::Forever => false,
            };
            if expired {
                let key = (entry.next_fire, id);
                timers.by_id.remove(&id);
                timers.deadlines.remove(&key);
            } else if entry.next_fire == deadline {
                entry.next_fire = deadline + entry.interval;
                timers.deadlines.insert((entry.next_fire, id), ());
            }
        }
        result
    }

    // Puts the unfired remainder of a due snapshot back into the deadline
    // index when a stop request or a handler error cuts the pass short.
    fn requeue_due(&self, rest: &[(Instant, u64)]) {
        let timers = &mut *self.inner.timers.borrow_mut();
        for &(deadline, id) in rest {
            if let Some(entry) = timers.by_id.get(&id) {
                if entry.next_fire == deadline {
                    timers.deadlines.insert((deadline, id), ());
                }
            }
        }
    }

    fn dispatch_sockets(&self, socket_count: usize) -> Result<()> {
        for index in 0..socket_count {
            let (fd, ready) = {
                let poll_set = self.inner.poll_set.borrow();
                let entry = &poll_set[index];
                (entry.fd, entry.is_readable())
            };
            if !ready {
                continue;
            }
            let handler = {
                let sockets = self.inner.sockets.borrow();
                let registration = &sockets[index];
                debug_assert_eq!(registration.fd, fd);
                if !registration.live {
                    continue;
                }
                Rc::clone(&registration.handler)
            };
            (*handler.borrow_mut())(self, fd)?;
            if self.inner.stop_requested.get() {
                return Ok(());
            }
        }
        Ok(())
    }
}

impl Default for Reactor {
    fn default() -> Reactor {
        Reactor::new()
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Reactor { .. }")
    }
}

struct RunningGuard<'a>(&'a Cell<bool>);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::poller::PollFlags;
    use std::io;

    #[derive(Clone)]
    struct TestClock {
        now: Rc<Cell<Instant>>,
    }

    impl TestClock {
        fn new() -> TestClock {
            TestClock {
                now: Rc::new(Cell::new(Instant::now())),
            }
        }

        fn advance(&self, by: Duration) {
            self.now.set(self.now.get() + by);
        }
    }

    impl Clock for TestClock {
        fn now(&self) -> Instant {
            self.now.get()
        }
    }

    // Replays a script of per-pass ready fd sets. When the script runs
    // out, a finite poll timeout advances the clock by exactly that
    // amount (a perfect sleep), and an infinite one is an error, since a
    // deterministic test should never reach it.
    struct ScriptedPoller {
        clock: TestClock,
        script: VecDeque<Vec<RawFd>>,
    }

    impl ScriptedPoller {
        fn sleeper(clock: &TestClock) -> ScriptedPoller {
            ScriptedPoller {
                clock: clock.clone(),
                script: VecDeque::new(),
            }
        }

        fn with_script(clock: &TestClock, script: &[&[RawFd]]) -> ScriptedPoller {
            ScriptedPoller {
                clock: clock.clone(),
                script: script.iter().map(|fds| fds.to_vec()).collect(),
            }
        }
    }

    impl Poller for ScriptedPoller {
        fn poll(
            &mut self,
            entries: &mut [PollEntry],
            timeout: Option<Duration>,
        ) -> io::Result<usize> {
            for entry in entries.iter_mut() {
                entry.ready = PollFlags::empty();
            }
            if let Some(batch) = self.script.pop_front() {
                let mut ready = 0;
                for entry in entries.iter_mut() {
                    if batch.contains(&entry.fd) {
                        entry.ready = PollFlags::POLLIN;
                        ready += 1;
                    }
                }
                return Ok(ready);
            }
            match timeout {
                Some(timeout) => {
                    self.clock.advance(timeout);
                    Ok(0)
                }
                None => Err(io::Error::new(
                    io::ErrorKind::Other,
                    "poll script exhausted with nothing to wake for",
                )),
            }
        }
    }

    fn test_reactor(clock: &TestClock) -> Reactor {
        Reactor::with_parts(Box::new(ScriptedPoller::sleeper(clock)), Box::new(clock.clone()))
    }

    fn scripted_reactor(clock: &TestClock, script: &[&[RawFd]]) -> Reactor {
        Reactor::with_parts(
            Box::new(ScriptedPoller::with_script(clock, script)),
            Box::new(clock.clone()),
        )
    }

    #[test]
    fn bounded_timer_fires_exactly_count_times_on_a_drift_free_cadence() {
        let clock = TestClock::new();
        let reactor = test_reactor(&clock);
        let epoch = clock.now();

        let fires = Rc::new(RefCell::new(Vec::new()));
        let record = Rc::clone(&fires);
        let observer = clock.clone();
        reactor.add_timer(Duration::from_millis(10), Repeat::Times(3), move |_, _| {
            record.borrow_mut().push(observer.now() - epoch);
            Ok(())
        });

        reactor.run().unwrap();
        assert_eq!(
            *fires.borrow(),
            vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(30)
            ]
        );
    }

    #[test]
    fn zero_count_timer_never_fires_and_its_id_is_already_expired() {
        let clock = TestClock::new();
        let reactor = test_reactor(&clock);
        let id = reactor.add_timer(Duration::from_millis(5), Repeat::Times(0), |_, _| {
            panic!("a zero-count timer fired")
        });

        reactor.run().unwrap();
        assert!(matches!(
            reactor.remove_timer(id),
            Err(RockpoolError::InvalidTimerId { .. })
        ));
    }

    #[test]
    fn timers_due_at_the_same_instant_fire_in_ascending_id_order() {
        let clock = TestClock::new();
        let reactor = test_reactor(&clock);

        let order = Rc::new(RefCell::new(Vec::new()));
        for tag in 1..=3 {
            let order = Rc::clone(&order);
            reactor.add_timer(Duration::from_millis(10), Repeat::Times(1), move |_, _| {
                order.borrow_mut().push(tag);
                Ok(())
            });
        }

        reactor.run().unwrap();
        assert_eq!(*order.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn late_passes_catch_up_without_drifting_the_cadence() {
        let clock = TestClock::new();
        let reactor = test_reactor(&clock);
        let epoch = clock.now();

        // The first handler invocation stalls the loop for 35ms. The
        // missed deadlines at 20, 30 and 40ms each still get their own
        // fire, one per pass, through zero-timeout polls.
        let fires = Rc::new(RefCell::new(Vec::new()));
        let record = Rc::clone(&fires);
        let stall = clock.clone();
        reactor.add_timer(Duration::from_millis(10), Repeat::Forever, move |reactor, _| {
            record.borrow_mut().push(stall.now() - epoch);
            if record.borrow().len() == 1 {
                stall.advance(Duration::from_millis(35));
            }
            if record.borrow().len() == 4 {
                reactor.stop();
            }
            Ok(())
        });

        reactor.run().unwrap();
        assert_eq!(
            *fires.borrow(),
            vec![
                Duration::from_millis(10),
                Duration::from_millis(45),
                Duration::from_millis(45),
                Duration::from_millis(45)
            ]
        );
    }

    #[test]
    fn restart_timer_interval_realigns_the_cadence() {
        let clock = TestClock::new();
        let reactor = test_reactor(&clock);

        let count = Rc::new(Cell::new(0));
        let counter = Rc::clone(&count);
        let count_timer =
            reactor.add_timer(Duration::from_millis(20), Repeat::Forever, move |_, _| {
                counter.set(counter.get() + 1);
                Ok(())
            });

        let observed = Rc::clone(&count);
        reactor.add_timer(
            Duration::from_millis(50),
            Repeat::Times(1),
            move |reactor, _| {
                assert_eq!(observed.get(), 2);
                reactor.restart_timer_interval(count_timer)
            },
        );
        reactor.add_timer(
            Duration::from_millis(85),
            Repeat::Times(1),
            |reactor, _| {
                reactor.stop();
                Ok(())
            },
        );

        reactor.run().unwrap();
        // 20ms and 40ms fire normally; the restart at 50ms moves the next
        // fire to 70ms, so the would-be fires at 60ms and 80ms are gone.
        assert_eq!(count.get(), 3);
    }

    #[test]
    fn restart_from_the_dispatched_handler_realigns_the_next_fire_from_now() {
        let clock = TestClock::new();
        let reactor = test_reactor(&clock);
        let epoch = clock.now();

        let fires = Rc::new(RefCell::new(Vec::new()));
        let record = Rc::clone(&fires);
        let handler_clock = clock.clone();
        reactor.add_timer(Duration::from_millis(10), Repeat::Forever, move |reactor, id| {
            record.borrow_mut().push(handler_clock.now() - epoch);
            if record.borrow().len() == 1 {
                // Simulate work, then restart: the next fire counts from
                // the restart, not from the old deadline.
                handler_clock.advance(Duration::from_millis(3));
                reactor.restart_timer_interval(id)?;
            } else {
                reactor.stop();
            }
            Ok(())
        });

        reactor.run().unwrap();
        assert_eq!(
            *fires.borrow(),
            vec![Duration::from_millis(10), Duration::from_millis(23)]
        );
    }

    #[test]
    fn a_timer_may_remove_itself_while_being_dispatched() {
        let clock = TestClock::new();
        let reactor = test_reactor(&clock);

        let fires = Rc::new(Cell::new(0));
        let counter = Rc::clone(&fires);
        let id = reactor.add_timer(Duration::from_millis(10), Repeat::Times(5), move |reactor, id| {
            counter.set(counter.get() + 1);
            reactor.remove_timer(id)
        });

        reactor.run().unwrap();
        assert_eq!(fires.get(), 1);
        assert!(matches!(
            reactor.remove_timer(id),
            Err(RockpoolError::InvalidTimerId { .. })
        ));
    }

    #[test]
    fn removing_another_due_timer_suppresses_its_fire_in_the_same_pass() {
        let clock = TestClock::new();
        let reactor = test_reactor(&clock);

        // Both timers are due at the same instant; the first removes the
        // second, which must then not fire at all.
        let removed_fires = Rc::new(Cell::new(0));
        let victim_id = Rc::new(Cell::new(None));

        let victim_slot = Rc::clone(&victim_id);
        reactor.add_timer(Duration::from_millis(10), Repeat::Times(1), move |reactor, _| {
            reactor.remove_timer(victim_slot.get().unwrap())
        });
        let counter = Rc::clone(&removed_fires);
        let id = reactor.add_timer(Duration::from_millis(10), Repeat::Times(1), move |_, _| {
            counter.set(counter.get() + 1);
            Ok(())
        });
        victim_id.set(Some(id));

        reactor.run().unwrap();
        assert_eq!(removed_fires.get(), 0);
    }

    #[test]
    fn stop_requested_before_run_makes_run_return_immediately() {
        let clock = TestClock::new();
        let reactor = test_reactor(&clock);
        reactor.add_timer(Duration::from_millis(10), Repeat::Forever, |_, _| {
            panic!("the loop should never have reached a timer")
        });

        reactor.stop();
        reactor.run().unwrap();
    }

    #[test]
    fn immediate_events_run_fifo_and_drain_within_a_single_pass() {
        let clock = TestClock::new();
        let reactor = test_reactor(&clock);

        let order = Rc::new(RefCell::new(Vec::new()));
        let first = Rc::clone(&order);
        reactor.add_immediate_event(move |reactor| {
            first.borrow_mut().push(1);
            let nested = Rc::clone(&first);
            reactor.add_immediate_event(move |_| {
                nested.borrow_mut().push(3);
                Ok(())
            });
            Ok(())
        });
        let second = Rc::clone(&order);
        reactor.add_immediate_event(move |_| {
            second.borrow_mut().push(2);
            Ok(())
        });

        // No sockets and no timers: one pass drains all three events,
        // including the one queued mid-drain, then the loop exits.
        reactor.run().unwrap();
        assert_eq!(*order.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn immediate_events_run_before_timer_work() {
        let clock = TestClock::new();
        let reactor = test_reactor(&clock);

        let order = Rc::new(RefCell::new(Vec::new()));
        let from_timer = Rc::clone(&order);
        reactor.add_timer(Duration::from_millis(1), Repeat::Times(1), move |_, _| {
            from_timer.borrow_mut().push("timer");
            Ok(())
        });
        let from_event = Rc::clone(&order);
        reactor.add_immediate_event(move |_| {
            from_event.borrow_mut().push("immediate");
            Ok(())
        });

        reactor.run().unwrap();
        assert_eq!(*order.borrow(), vec!["immediate", "timer"]);
    }

    #[test]
    fn stop_from_an_immediate_event_leaves_the_rest_of_the_queue_intact() {
        let clock = TestClock::new();
        let reactor = test_reactor(&clock);

        let ran = Rc::new(RefCell::new(Vec::new()));
        let first = Rc::clone(&ran);
        reactor.add_immediate_event(move |reactor| {
            first.borrow_mut().push(1);
            reactor.stop();
            Ok(())
        });
        let second = Rc::clone(&ran);
        reactor.add_immediate_event(move |_| {
            second.borrow_mut().push(2);
            Ok(())
        });

        reactor.run().unwrap();
        assert_eq!(*ran.borrow(), vec![1]);

        // The undrained event survived the stop and runs next time.
        reactor.run().unwrap();
        assert_eq!(*ran.borrow(), vec![1, 2]);
    }

    #[test]
    fn socket_handlers_fire_in_registration_order_and_removal_suppresses_the_rest() {
        let clock = TestClock::new();
        let reactor = scripted_reactor(&clock, &[&[7]]);

        make_shared_var_mut!(Vec::new(), calls, calls_first, calls_second, calls_third);
        reactor.add_socket(7, move |_, _| {
            calls_first.borrow_mut().push("first");
            Ok(())
        });
        reactor.add_socket(7, move |reactor, fd| {
            calls_second.borrow_mut().push("second");
            reactor.remove_socket(fd);
            Ok(())
        });
        reactor.add_socket(7, move |_, _| {
            calls_third.borrow_mut().push("third");
            Ok(())
        });

        // After the removal sweeps every handler for fd 7, nothing is
        // left to wait on and the loop exits by itself.
        reactor.run().unwrap();
        assert_eq!(*calls.borrow(), vec!["first", "second"]);
    }

    #[test]
    fn sockets_added_during_dispatch_only_fire_from_the_next_pass() {
        let clock = TestClock::new();
        let reactor = scripted_reactor(&clock, &[&[7], &[7]]);

        let original = Rc::new(Cell::new(0));
        let added = Rc::new(Cell::new(0));

        let original_count = Rc::clone(&original);
        let added_count = Rc::clone(&added);
        reactor.add_socket(7, move |reactor, fd| {
            original_count.set(original_count.get() + 1);
            if original_count.get() == 1 {
                let added_count = Rc::clone(&added_count);
                reactor.add_socket(fd, move |reactor, _| {
                    added_count.set(added_count.get() + 1);
                    reactor.stop();
                    Ok(())
                });
            }
            Ok(())
        });

        reactor.run().unwrap();
        assert_eq!(original.get(), 2);
        assert_eq!(added.get(), 1);
    }

    #[test]
    fn handler_errors_propagate_out_of_run_with_registrations_intact() {
        let clock = TestClock::new();
        let reactor = test_reactor(&clock);

        let fires = Rc::new(Cell::new(0));
        let counter = Rc::clone(&fires);
        reactor.add_timer(Duration::from_millis(10), Repeat::Times(2), move |_, _| {
            counter.set(counter.get() + 1);
            Err(io::Error::new(io::ErrorKind::Other, "handler failure").into())
        });

        assert!(matches!(reactor.run(), Err(RockpoolError::IoError(_))));
        assert_eq!(fires.get(), 1);

        // The timer still owes its second fire.
        assert!(matches!(reactor.run(), Err(RockpoolError::IoError(_))));
        assert_eq!(fires.get(), 2);

        // Now the timer is spent and the loop has nothing left to do.
        reactor.run().unwrap();
        assert_eq!(fires.get(), 2);
    }

    #[test]
    fn a_poller_fault_surfaces_from_run() {
        let clock = TestClock::new();
        // A socket but no timers: the first poll has an infinite timeout,
        // which the exhausted script reports as a fault.
        let reactor = scripted_reactor(&clock, &[]);
        reactor.add_socket(7, |_, _| Ok(()));

        assert!(matches!(reactor.run(), Err(RockpoolError::IoError(_))));
    }

    #[test]
    fn run_returns_when_the_last_bounded_timer_expires() {
        let clock = TestClock::new();
        let reactor = test_reactor(&clock);

        make_shared_var!(Cell::new(0), count, counter);
        reactor.add_timer(Duration::from_millis(20), Repeat::Times(2), move |_, _| {
            counter.set(counter.get() + 1);
            Ok(())
        });

        reactor.run().unwrap();
        assert_eq!(count.get(), 2);
    }
}
