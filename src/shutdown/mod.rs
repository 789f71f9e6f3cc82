//! SIGINT/SIGTERM latch polled by the accept loop.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[cfg(unix)]
use signal_hook::consts::signal::{SIGINT, SIGTERM};
#[cfg(unix)]
use signal_hook::flag;
#[cfg(unix)]
use signal_hook::low_level::unregister;
#[cfg(unix)]
use signal_hook::SigId;

pub struct ShutdownHooks {
    triggered: Arc<AtomicBool>,
    #[cfg(unix)]
    registrations: Vec<SigId>,
}

impl ShutdownHooks {
    /// Registers the termination signals. The handlers only set a flag; the
    /// intake loop notices it on its next poll.
    pub fn install() -> io::Result<Self> {
        let triggered = Arc::new(AtomicBool::new(false));

        #[cfg(unix)]
        {
            let mut registrations = Vec::with_capacity(2);
            for signal in [SIGINT, SIGTERM] {
                match flag::register(signal, Arc::clone(&triggered)) {
                    Ok(id) => registrations.push(id),
                    Err(error) => {
                        for id in registrations {
                            unregister(id);
                        }
                        return Err(error);
                    }
                }
            }
            Ok(Self {
                triggered,
                registrations,
            })
        }

        #[cfg(not(unix))]
        {
            Ok(Self { triggered })
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }
}

impl Drop for ShutdownHooks {
    fn drop(&mut self) {
        #[cfg(unix)]
        for id in self.registrations.drain(..) {
            unregister(id);
        }
    }
}
