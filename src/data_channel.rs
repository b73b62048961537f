use crate::error::Error;
use arc_swap::ArcSwap;
use bytes::Bytes;
use futures_util::Future;
use futures_util::{ready, Sink, Stream};
use std::future::poll_fn;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio_util::sync::ReusableBoxFuture;
use webrtc::data_channel::RTCDataChannel;

/// Data channel exposed as a [Stream] of received payloads and a [Sink] of
/// payloads to send. Contacts use it to push file chunks.
pub struct DataChannel {
    dc: Arc<RTCDataChannel>,
    status: Arc<ArcSwap<ChannelState>>,
    /// Received payloads waiting to be read. `Ok(None)` marks a graceful close.
    sender: UnboundedSender<Result<Option<Bytes>, Error>>,
    receiver: UnboundedReceiver<Result<Option<Bytes>, Error>>,
    sink_state: SinkState,
    /// While the channel is `Waiting` this future awaits the channel opening,
    /// afterwards it tracks the pending send.
    send_waiter: ReusableBoxFuture<'static, Result<(), Error>>,
}

impl DataChannel {
    pub fn new(dc: Arc<RTCDataChannel>) -> Self {
        let (sender, receiver) = unbounded_channel();
        let status = Arc::new(ArcSwap::new(ChannelState::waiting()));
        let s = Arc::downgrade(&status);
        dc.on_open(Box::new(move || {
            Box::pin(async move {
                if let Some(status) = s.upgrade() {
                    let old = status.rcu(|old| match &**old {
                        ChannelState::Waiting { .. } => ChannelState::open(),
                        _ => old.clone(),
                    });
                    if let ChannelState::Waiting { ready } = &*old {
                        ready.notify_waiters();
                    }
                }
            })
        }));
        let s = Arc::downgrade(&status);
        let tx = sender.clone();
        dc.on_close(Box::new(move || {
            let s = s.clone();
            let tx = tx.clone();
            Box::pin(async move {
                if let Some(status) = s.upgrade() {
                    let old = status.swap(ChannelState::closed_gracefully());
                    match &*old {
                        ChannelState::Waiting { ready } => ready.notify_waiters(),
                        ChannelState::Open => {
                            let _ = tx.send(Ok(None));
                        }
                        ChannelState::Closed { .. } => {}
                    }
                }
            })
        }));
        let s = Arc::downgrade(&status);
        let tx = sender.clone();
        dc.on_error(Box::new(move |e| {
            let s = s.clone();
            let tx = tx.clone();
            Box::pin(async move {
                if let Some(status) = s.upgrade() {
                    let error: Error = e.into();
                    let old = status.swap(ChannelState::failed(error.clone()));
                    match &*old {
                        ChannelState::Waiting { ready } => ready.notify_waiters(),
                        ChannelState::Open => {
                            let _ = tx.send(Err(error));
                        }
                        ChannelState::Closed { .. } => {}
                    }
                }
            })
        }));
        let s = Arc::downgrade(&status);
        let tx = sender.clone();
        dc.on_message(Box::new(move |msg| {
            let s = s.clone();
            let tx = tx.clone();
            Box::pin(async move {
                if let Some(status) = s.upgrade() {
                    let status = Self::ready_internal(&status).await;
                    if status.is_open() {
                        let _ = tx.send(Ok(Some(msg.data)));
                    }
                }
            })
        }));
        let notify = status.clone();
        let send_waiter = ReusableBoxFuture::new(async move {
            match &*Self::ready_internal(&notify).await {
                ChannelState::Closed {
                    reason: Some(reason),
                } => Err(reason.clone()),
                _ => Ok(()),
            }
        });
        DataChannel {
            dc,
            sender,
            receiver,
            status,
            sink_state: SinkState::Idle,
            send_waiter,
        }
    }

    pub fn label(&self) -> &str {
        self.dc.label()
    }

    pub fn is_open(&self) -> bool {
        self.status.load().is_open()
    }

    pub fn is_closed(&self) -> bool {
        self.status.load().is_closed()
    }

    /// Waits until the channel opens. Returns `Ok(false)` if it was closed
    /// gracefully before that happened.
    pub async fn ready(&self) -> Result<bool, Error> {
        let status = Self::ready_internal(&self.status).await;
        match &*status {
            ChannelState::Open => Ok(true),
            ChannelState::Closed { reason: Some(reason) } => Err(reason.clone()),
            _ => Ok(false),
        }
    }

    /// Closes the channel, waiting for an in-flight send to finish first.
    pub async fn close(&mut self) -> Result<(), Error> {
        let old = self.status.rcu(|old| match &**old {
            ChannelState::Closed { .. } => old.clone(),
            _ => ChannelState::closed_gracefully(),
        });
        if let ChannelState::Waiting { ready } = &*old {
            ready.notify_waiters();
        }
        let _ = self.sender.send(Ok(None));
        if self.sink_state == SinkState::Awaiting {
            poll_fn(|cx| self.send_waiter.poll(cx)).await?;
            self.sink_state = SinkState::Idle;
        }
        self.dc.close().await?;
        Ok(())
    }

    async fn ready_internal(status: &Arc<ArcSwap<ChannelState>>) -> Arc<ChannelState> {
        loop {
            let current = status.load_full();
            match &*current {
                ChannelState::Waiting { ready } => {
                    // registered before the re-check, so a transition stored
                    // after it still wakes us
                    let notified = ready.notified();
                    if Arc::ptr_eq(&current, &*status.load()) {
                        notified.await;
                    }
                }
                _ => return current,
            }
        }
    }
}

impl Stream for DataChannel {
    type Item = Result<Bytes, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match ready!(self.receiver.poll_recv(cx)) {
            Some(Ok(Some(data))) => Poll::Ready(Some(Ok(data))),
            Some(Err(e)) => Poll::Ready(Some(Err(e))),
            Some(Ok(None)) | None => {
                self.receiver.close();
                Poll::Ready(None)
            }
        }
    }
}

impl Sink<Bytes> for DataChannel {
    type Error = Error;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        match &**self.status.load() {
            ChannelState::Open => match self.sink_state {
                SinkState::Idle => Poll::Ready(Ok(())),
                SinkState::Awaiting => {
                    let res = ready!(self.send_waiter.poll(cx));
                    self.sink_state = SinkState::Idle;
                    Poll::Ready(res)
                }
            },
            // until the channel opens, send_waiter awaits the open transition
            ChannelState::Waiting { .. } => self.send_waiter.poll(cx),
            ChannelState::Closed { .. } => Poll::Ready(Err(Error::channel_closed())),
        }
    }

    fn start_send(mut self: Pin<&mut Self>, item: Bytes) -> Result<(), Self::Error> {
        let dc = self.dc.clone();
        self.send_waiter.set(async move {
            dc.send(&item).await?;
            Ok(())
        });
        self.sink_state = SinkState::Awaiting;
        Ok(())
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        match self.sink_state {
            SinkState::Idle => {
                if self.status.load().is_closed() {
                    Poll::Ready(Err(Error::channel_closed()))
                } else {
                    Poll::Ready(Ok(()))
                }
            }
            SinkState::Awaiting => {
                let res = ready!(self.send_waiter.poll(cx));
                self.sink_state = SinkState::Idle;
                Poll::Ready(res)
            }
        }
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let mut fut = Box::pin(self.close());
        fut.as_mut().poll(cx)
    }
}

impl std::fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataChannel")
            .field("label", &self.dc.label())
            .field("state", &**self.status.load())
            .finish()
    }
}

#[derive(Debug)]
enum ChannelState {
    Waiting { ready: Notify },
    Open,
    Closed { reason: Option<Error> },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum SinkState {
    Idle,
    Awaiting,
}

impl ChannelState {
    fn waiting() -> Arc<Self> {
        Arc::new(ChannelState::Waiting {
            ready: Notify::new(),
        })
    }

    fn open() -> Arc<Self> {
        Arc::new(ChannelState::Open)
    }

    fn closed_gracefully() -> Arc<Self> {
        Arc::new(ChannelState::Closed { reason: None })
    }

    fn failed(reason: Error) -> Arc<Self> {
        Arc::new(ChannelState::Closed {
            reason: Some(reason),
        })
    }

    fn is_open(&self) -> bool {
        matches!(self, ChannelState::Open)
    }

    fn is_closed(&self) -> bool {
        matches!(self, ChannelState::Closed { .. })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Options;
    use crate::connection::{Connection, RtcConnection};
    use futures_util::{SinkExt, StreamExt};

    #[tokio::test]
    async fn closing_before_open_releases_waiters() -> Result<(), Error> {
        let options = Options {
            ice_servers: vec![],
            ..Options::default()
        };
        let (tx, _rx) = unbounded_channel();
        let conn = RtcConnection::start(&options, tx).await?;
        let mut dc = conn.create_data_channel("file").await?;
        assert_eq!(dc.label(), "file");
        assert!(!dc.is_open());

        dc.close().await?;
        assert!(dc.is_closed());
        assert!(!dc.ready().await?);
        assert!(dc.send(Bytes::from_static(b"chunk")).await.is_err());
        assert!(dc.next().await.is_none());

        conn.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn parked_waiters_see_the_stored_transition() -> Result<(), Error> {
        let options = Options {
            ice_servers: vec![],
            ..Options::default()
        };
        let (tx, _rx) = unbounded_channel();
        let conn = RtcConnection::start(&options, tx).await?;
        let mut dc = conn.create_data_channel("file").await?;

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let status = dc.status.clone();
                tokio::spawn(async move { DataChannel::ready_internal(&status).await.is_closed() })
            })
            .collect();
        tokio::task::yield_now().await;

        dc.close().await?;
        for waiter in waiters {
            assert!(waiter.await.unwrap());
        }
        conn.close().await?;
        Ok(())
    }
}
