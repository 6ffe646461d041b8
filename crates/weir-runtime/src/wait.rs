//! Completion handles for control-plane requests.
//!
//! A control message is acknowledged with a string: empty on success, the
//! error text otherwise. The sender side travels inside the message; the
//! caller keeps the handle and collects the outcome later, so a batch of
//! requests can be issued before waiting on any of them.

use std::sync::OnceLock;

use tokio::runtime::{Builder, Runtime};
use tokio::sync::oneshot;

/// Parks control-plane threads while they wait for actor acknowledgements.
///
/// Commit, teardown, and test code all wait from plain OS threads, so a
/// small dedicated runtime does the blocking for them. A reply is a bare
/// oneshot with no timers behind it; one worker thread is plenty.
fn reply_runtime() -> &'static Runtime {
    static RUNTIME: OnceLock<Runtime> = OnceLock::new();
    RUNTIME.get_or_init(|| {
        Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("weir-reply")
            .build()
            .expect("failed to build control reply runtime")
    })
}

fn block_on_reply(rx: oneshot::Receiver<String>) -> String {
    let wait = async {
        rx.await
            .unwrap_or_else(|_| "responder exited before acknowledging".to_string())
    };
    // A caller already sitting on a tokio worker (an async control surface
    // collecting a handle synchronously) must not park that worker's
    // driver; route it through block_in_place on its own runtime instead.
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => tokio::task::block_in_place(|| handle.block_on(wait)),
        Err(_) => reply_runtime().block_on(wait),
    }
}

pub struct WaitToken {
    tx: oneshot::Sender<String>,
}

impl WaitToken {
    /// Acknowledge success.
    pub fn ok(self) {
        let _ = self.tx.send(String::new());
    }

    /// Acknowledge failure with the error text.
    pub fn fail(self, message: impl Into<String>) {
        let _ = self.tx.send(message.into());
    }

    pub fn complete(self, info: impl Into<String>) {
        let _ = self.tx.send(info.into());
    }
}

pub struct WaitHandle {
    inner: WaitInner,
}

enum WaitInner {
    Pending(oneshot::Receiver<String>),
    Ready(String),
}

impl WaitHandle {
    pub fn pair() -> (WaitToken, WaitHandle) {
        let (tx, rx) = oneshot::channel();
        (
            WaitToken { tx },
            WaitHandle {
                inner: WaitInner::Pending(rx),
            },
        )
    }

    /// An already-resolved handle for synchronous request paths.
    pub fn ready(info: impl Into<String>) -> WaitHandle {
        WaitHandle {
            inner: WaitInner::Ready(info.into()),
        }
    }

    /// Block until the request is acknowledged. Returns the empty string on
    /// success, the error text otherwise. A dropped token reads as the
    /// responder having exited.
    pub fn wait_info(self) -> String {
        match self.inner {
            WaitInner::Ready(info) => info,
            WaitInner::Pending(rx) => block_on_reply(rx),
        }
    }

    pub async fn wait_info_async(self) -> String {
        match self.inner {
            WaitInner::Ready(info) => info,
            WaitInner::Pending(rx) => rx
                .await
                .unwrap_or_else(|_| "responder exited before acknowledging".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::WaitHandle;

    #[test]
    fn ready_handle_returns_its_info() {
        assert_eq!(WaitHandle::ready("").wait_info(), "");
        assert_eq!(WaitHandle::ready("boom").wait_info(), "boom");
    }

    #[test]
    fn token_ok_reads_as_empty_info() {
        let (token, handle) = WaitHandle::pair();
        token.ok();
        assert_eq!(handle.wait_info(), "");
    }

    #[test]
    fn token_failure_carries_the_error_text() {
        let (token, handle) = WaitHandle::pair();
        token.fail("no such port");
        assert_eq!(handle.wait_info(), "no such port");
    }

    #[test]
    fn dropped_token_reads_as_responder_exit() {
        let (token, handle) = WaitHandle::pair();
        drop(token);
        assert!(handle.wait_info().contains("exited"));
    }

    #[test]
    fn waiting_works_from_many_plain_threads_at_once() {
        let mut joins = Vec::new();
        for i in 0..8u32 {
            joins.push(std::thread::spawn(move || {
                let (token, handle) = WaitHandle::pair();
                token.complete(i.to_string());
                handle.wait_info()
            }));
        }
        for (i, join) in joins.into_iter().enumerate() {
            assert_eq!(join.join().expect("join waiter"), i.to_string());
        }
    }
}
