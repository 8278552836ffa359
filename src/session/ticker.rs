//! Background thread that drives the once-a-second progress tick

use std::io;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TickCommand {
    Suspend,
    /// Start ticking; the first tick runs straight away
    Resume,
    Shutdown,
}

/// Cloneable handle for steering a running ticker
#[derive(Clone)]
pub(crate) struct TickControl {
    tx: Sender<TickCommand>,
}

impl TickControl {
    /// Control handle plus the receiving end a ticker runs on
    pub fn channel() -> (Self, Receiver<TickCommand>) {
        let (tx, rx) = channel();
        (Self { tx }, rx)
    }

    pub fn suspend(&self) {
        let _ = self.tx.send(TickCommand::Suspend);
    }

    pub fn resume(&self) {
        let _ = self.tx.send(TickCommand::Resume);
    }
}

pub(crate) struct Ticker {
    control: TickControl,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    /// Spawn a suspended ticker listening on `rx`. `on_tick` returning
    /// `false` ends the thread.
    pub fn spawn<F>(control: TickControl, rx: Receiver<TickCommand>, interval: Duration, on_tick: F) -> io::Result<Self>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name("progress-tick".to_string())
            .spawn(move || run(rx, interval, on_tick))?;
        Ok(Self { control, handle: Some(handle) })
    }

    /// Stop the thread and wait for it to exit
    pub fn shutdown(mut self) {
        let _ = self.control.tx.send(TickCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run<F>(rx: Receiver<TickCommand>, interval: Duration, mut on_tick: F)
where
    F: FnMut() -> bool,
{
    let mut running = false;
    loop {
        let command = if running {
            match rx.recv_timeout(interval) {
                Ok(command) => Some(command),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        } else {
            match rx.recv() {
                Ok(command) => Some(command),
                Err(_) => break,
            }
        };

        match command {
            None => {
                if !on_tick() {
                    break;
                }
            }
            Some(TickCommand::Suspend) => running = false,
            Some(TickCommand::Resume) => {
                running = true;
                if !on_tick() {
                    break;
                }
            }
            Some(TickCommand::Shutdown) => break,
        }
    }
    debug!("Progress ticker exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_suspended_until_resumed() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let (control, rx) = TickControl::channel();
        let ticker = Ticker::spawn(control.clone(), rx, Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        })
        .unwrap();

        thread::sleep(Duration::from_millis(40));
        assert_eq!(ticks.load(Ordering::SeqCst), 0);

        control.resume();
        thread::sleep(Duration::from_millis(60));
        assert!(ticks.load(Ordering::SeqCst) >= 2);

        control.suspend();
        thread::sleep(Duration::from_millis(20));
        let after_suspend = ticks.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(40));
        assert_eq!(ticks.load(Ordering::SeqCst), after_suspend);

        ticker.shutdown();
    }

    #[test]
    fn test_callback_can_end_thread() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let (control, rx) = TickControl::channel();
        let ticker = Ticker::spawn(control.clone(), rx, Duration::from_millis(1), move || counter.fetch_add(1, Ordering::SeqCst) < 2).unwrap();
        control.resume();
        // shutdown joins, so this returns only once the thread is gone
        thread::sleep(Duration::from_millis(30));
        ticker.shutdown();
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }
}
