//! Main loop driver
//!
//! Owns everything one iteration touches and runs the iteration itself:
//!
//! ```text
//! reset sets ─▶ network stack: timeout + interest
//!            ─▶ device I/O handlers: interest
//!            ─▶ alarm: bound timeout by next timer deadline
//!            ─▶ host wait (lock released; framework fill/poll/dispatch)
//!            ─▶ device I/O handlers: dispatch
//!            ─▶ network stack: dispatch
//!            ─▶ due timers
//! ```
//!
//! Construction performs the startup sequence: clocks, alarm, signal
//! bridge, async context. Registration surfaces live in
//! [`MainLoopShared`], which any thread may hold.

use std::os::unix::io::RawFd;
use std::sync::Arc;

use hostloop_core::{kdebug, ktrace, BigLock, BigLockGuard, LoopResult, Timeout};
use hostloop_core::constants::PRIORITY_DEFAULT;

use crate::aio::AioContext;
use crate::config::{MainLoopConfig, WaitBackendKind};
use crate::fdset::DescriptorSet;
use crate::iohandler::{DeviceIoMultiplexer, IoHandlerRegistry};
use crate::signal::{SignalBridge, SignalHandlers};
use crate::source::{EventSourceFusion, SourceContext, SourceId};
use crate::timer::{init_clocks, init_timer_alarm, AlarmTimer, TimerSubsystem};
use crate::wait::{new_host_wait, HandleRegistry, HostWait};

/// The user-mode network stack collaborator
pub trait NetworkStack: Send {
    /// Shrink the iteration timeout if the stack has timers of its own
    fn update_timeout(&mut self, timeout: &mut Timeout);

    /// Add interest for the stack's descriptors
    fn fill_descriptors(&mut self, sets: &mut DescriptorSet);

    /// Dispatch after the wait; `had_error` means the sets are meaningless
    fn poll_descriptors(&mut self, sets: &DescriptorSet, had_error: bool);
}

/// Registration surfaces shared with other threads
pub struct MainLoopShared {
    pub aio: Arc<AioContext>,
    pub sources: Arc<SourceContext>,
    pub iohandlers: Arc<IoHandlerRegistry>,
    pub timers: Arc<TimerSubsystem>,
    pub handles: Arc<HandleRegistry>,
    pub signal_handlers: Arc<SignalHandlers>,
}

impl MainLoopShared {
    /// Wake the loop from any thread
    #[inline]
    pub fn notify(&self) {
        self.aio.notify();
    }
}

impl std::fmt::Debug for MainLoopShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainLoopShared")
            .field("aio", &self.aio)
            .field("sources", &self.sources)
            .field("iohandlers", &self.iohandlers)
            .field("handles", &self.handles)
            .finish()
    }
}

pub struct MainLoop {
    config: MainLoopConfig,
    lock: Arc<BigLock>,
    shared: Arc<MainLoopShared>,
    fusion: EventSourceFusion,
    host_wait: Box<dyn HostWait>,
    alarm: Arc<dyn AlarmTimer>,
    signals: Option<SignalBridge>,
    net: Option<Box<dyn NetworkStack>>,
    sets: DescriptorSet,
    /// Alarm and signal descriptors, polled directly by the handle wait
    internal_fds: Vec<RawFd>,
    aio_source: SourceId,
    iterations: u64,
}

impl MainLoop {
    /// Run the startup sequence on the calling thread, which becomes the
    /// loop thread. Signal bridging blocks signals on this thread; threads
    /// it spawns afterwards inherit the mask.
    pub fn new(config: MainLoopConfig, lock: Arc<BigLock>) -> LoopResult<Self> {
        config.validate()?;
        if config.debug_logging {
            hostloop_core::kprint::set_log_level(hostloop_core::kprint::LogLevel::Debug);
        }

        let timers = init_clocks();
        let alarm = init_timer_alarm(config.alarm)?;
        let iohandlers = Arc::new(IoHandlerRegistry::new());
        let signal_handlers = Arc::new(SignalHandlers::new());

        let handles = Arc::new(HandleRegistry::new(config.max_wait_objects));

        let signals = if config.bridge_signals {
            let bridge = SignalBridge::new(Arc::clone(&signal_handlers))?;
            bridge.register(&iohandlers)?;
            Some(bridge)
        } else {
            None
        };

        let aio = AioContext::new(config.idle_bh_interval_ms)?;
        let sources = Arc::new(SourceContext::new());
        let aio_source = sources.attach(Box::new(aio.source()), PRIORITY_DEFAULT);

        let weak = Arc::downgrade(&aio);
        timers.set_kick(move || {
            if let Some(aio) = weak.upgrade() {
                aio.notify();
            }
        });

        if let Some(fd) = alarm.fd() {
            let a = Arc::clone(&alarm);
            iohandlers.set_fd_handler(fd, Some(Box::new(move || a.acknowledge())), None)?;
        }

        // The handle wait sleeps only on descriptors it polls
        let internal_fds: Vec<RawFd> = alarm
            .fd()
            .into_iter()
            .chain(signals.as_ref().map(SignalBridge::fd))
            .collect();
        if config.wait_backend == WaitBackendKind::HandlePoll {
            for &fd in &internal_fds {
                handles.fd_register(fd);
            }
        }
        let host_wait = new_host_wait(config.wait_backend, &handles);
        let fusion = EventSourceFusion::new(Arc::clone(&sources), config.poll_capacity);

        kdebug!(
            "main loop: wait={} alarm={} signals={}",
            host_wait.name(),
            alarm.name(),
            signals.is_some()
        );

        Ok(Self {
            config,
            lock,
            shared: Arc::new(MainLoopShared {
                aio,
                sources,
                iohandlers,
                timers,
                handles,
                signal_handlers,
            }),
            fusion,
            host_wait,
            alarm,
            signals,
            net: None,
            sets: DescriptorSet::new(),
            internal_fds,
            aio_source,
            iterations: 0,
        })
    }

    #[inline]
    pub fn config(&self) -> &MainLoopConfig {
        &self.config
    }

    #[inline]
    pub fn lock(&self) -> &Arc<BigLock> {
        &self.lock
    }

    #[inline]
    pub fn shared(&self) -> &Arc<MainLoopShared> {
        &self.shared
    }

    #[inline]
    pub fn aio(&self) -> &Arc<AioContext> {
        &self.shared.aio
    }

    /// Id of the async context's source in the framework
    #[inline]
    pub fn aio_source(&self) -> SourceId {
        self.aio_source
    }

    #[inline]
    pub fn signals(&self) -> Option<&SignalBridge> {
        self.signals.as_ref()
    }

    /// Install or remove the network stack collaborator.
    pub fn set_network_stack(&mut self, net: Option<Box<dyn NetworkStack>>) {
        self.net = net;
    }

    /// Completed iterations
    #[inline]
    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// Descriptor sets as left by the last iteration
    #[inline]
    pub fn last_sets(&self) -> &DescriptorSet {
        &self.sets
    }

    /// Run one iteration. Blocks until something is ready unless
    /// `nonblocking`. Returns the raw wait result.
    ///
    /// # Panics
    ///
    /// If `guard` does not hold this loop's execution lock.
    pub fn wait(&mut self, guard: &mut BigLockGuard<'_>, nonblocking: bool) -> i32 {
        assert!(
            self.lock.owns(guard),
            "main loop wait called without holding the execution lock"
        );

        let mut timeout = Timeout::for_iteration(nonblocking);
        self.sets.reset();

        if let Some(net) = self.net.as_mut() {
            net.update_timeout(&mut timeout);
            net.fill_descriptors(&mut self.sets);
        }
        self.shared.iohandlers.fill_descriptors(&mut self.sets);
        self.alarm.prepare(&self.shared.timers, &mut timeout);

        let ret = self.host_wait.wait(&mut self.fusion, &mut self.sets, timeout, guard);
        if cfg!(feature = "debug-logging") {
            ktrace!("main loop: timeout={} ret={}", timeout, ret);
        }

        self.shared.iohandlers.poll_descriptors(&self.sets, ret);
        if let Some(net) = self.net.as_mut() {
            net.poll_descriptors(&self.sets, ret < 0);
        }
        self.shared.timers.run_all_due_timers();

        self.iterations += 1;
        ret
    }
}

impl Drop for MainLoop {
    fn drop(&mut self) {
        self.shared.sources.remove(self.aio_source);
        for &fd in &self.internal_fds {
            self.shared.handles.fd_unregister(fd);
        }
        if let Some(fd) = self.alarm.fd() {
            self.shared.iohandlers.remove(fd);
        }
    }
}

impl std::fmt::Debug for MainLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainLoop")
            .field("wait", &self.host_wait.name())
            .field("alarm", &self.alarm.name())
            .field("signals", &self.signals)
            .field("iterations", &self.iterations)
            .finish()
    }
}
