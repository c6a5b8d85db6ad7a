use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow, Signal};

/// Uninterruptible section around the flush rename window.
///
/// Blocks the signals that commonly tear processes down mid-rewrite and
/// restores the previous mask on drop. The rename pair inside the guard
/// therefore completes indivisibly from the caller's perspective.
pub struct UninterruptibleSection {
    previous: Option<SigSet>,
}

impl UninterruptibleSection {
    pub fn enter() -> UninterruptibleSection {
        let mut set = SigSet::empty();
        set.add(Signal::SIGTERM);
        set.add(Signal::SIGHUP);
        set.add(Signal::SIGTSTP);
        set.add(Signal::SIGINT);
        set.add(Signal::SIGWINCH);
        let mut previous = SigSet::empty();
        match pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&set), Some(&mut previous)) {
            Ok(()) => UninterruptibleSection {
                previous: Some(previous),
            },
            Err(e) => {
                // Continue unguarded; the flush protocol is still
                // temp+rename safe, only less polite about signals.
                tracing::warn!(error = %e, "cannot block signals for flush");
                UninterruptibleSection { previous: None }
            }
        }
    }
}

impl Drop for UninterruptibleSection {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            let _ = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&previous), None);
        }
    }
}
