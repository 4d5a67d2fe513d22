//! Asynchronous signal bridging
//!
//! Moves SIGIO, SIGALRM and SIGBUS off asynchronous delivery and onto a
//! readable descriptor serviced by the main loop, so their handlers run as
//! ordinary loop callbacks.

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod linux;
        pub use linux::*;
    } else {
        compile_error!("signal bridging requires signalfd");
    }
}
