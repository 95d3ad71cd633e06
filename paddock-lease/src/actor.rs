use std::future::Future;

use tokio::{
    sync::oneshot,
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Common interface for services that handle requests over a channel.
/// The single consumer of the request channel is the serialization point:
/// no two requests are decided concurrently.
pub trait Actor {
    /// The type of request messages this service handles.
    type Request: Send + 'static;
    /// The type of response messages this service returns.
    type Response: Send + 'static;

    /// Run the service until cancelled or all clients are gone.
    fn run(
        &mut self,
        cancel: CancellationToken,
        request_rx: flume::Receiver<Self::Request>,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Where a request's response goes: back to a waiting caller, or nowhere.
pub enum ResponseChannel<T> {
    Drop,
    OneShot(oneshot::Sender<T>),
}

impl<T> Default for ResponseChannel<T> {
    fn default() -> ResponseChannel<T> {
        ResponseChannel::Drop
    }
}

impl<T> ResponseChannel<T> {
    /// Deliver the response. A caller that stopped waiting is not an
    /// error; the work it requested has already been done.
    pub fn send(self, response: T) {
        if let ResponseChannel::OneShot(tx) = self {
            let _ = tx.send(response);
        }
    }
}

impl<T> std::fmt::Debug for ResponseChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseChannel::Drop => write!(f, "ResponseChannel::Drop"),
            ResponseChannel::OneShot(_) => write!(f, "ResponseChannel::OneShot"),
        }
    }
}

/// Request messages that can carry a response channel.
pub trait Respondable: Send {
    type Response: Send + 'static;

    fn set_response(&mut self, ch: ResponseChannel<Self::Response>);
}

/// Owns a running actor task and hands out client handles to it.
pub struct Operator<Req> {
    cancel: CancellationToken,
    request_tx: flume::Sender<Req>,
    tasks: JoinSet<Result<()>>,
}

impl<Req: Send + 'static> Operator<Req> {
    #[tracing::instrument(skip_all)]
    pub fn new<A>(cancel: CancellationToken, mut actor: A) -> Operator<Req>
    where
        A: Actor<Request = Req> + Send + 'static,
    {
        let (request_tx, request_rx) = flume::unbounded();
        let task_cancel = cancel.child_token();
        let mut tasks = JoinSet::new();
        tasks.spawn(async move { actor.run(task_cancel, request_rx).await });
        Operator {
            cancel,
            request_tx,
            tasks,
        }
    }

    /// A cheap-to-clone handle for issuing requests to the actor.
    pub fn client(&self) -> ActorClient<Req> {
        ActorClient {
            request_tx: self.request_tx.clone(),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the actor task to finish. Termination is cooperative:
    /// call [`Operator::cancel`] first.
    pub async fn join(mut self) -> Result<()> {
        while let Some(res) = self.tasks.join_next().await {
            res.map_err(|err| Error::Other(err.into()))??;
        }
        Ok(())
    }
}

/// Client half of an actor's request channel.
pub struct ActorClient<Req> {
    request_tx: flume::Sender<Req>,
}

impl<Req> Clone for ActorClient<Req> {
    fn clone(&self) -> ActorClient<Req> {
        ActorClient {
            request_tx: self.request_tx.clone(),
        }
    }
}

impl<Req: Respondable + 'static> ActorClient<Req> {
    /// Send a request and wait for its response. Dropping the returned
    /// future abandons the wait but not the request: the actor still
    /// resolves it and reconciles its own state.
    pub async fn call(&self, mut req: Req) -> Result<Req::Response> {
        let (tx, rx) = oneshot::channel();
        req.set_response(ResponseChannel::OneShot(tx));
        self.request_tx.send_async(req).await?;
        Ok(rx.await?)
    }
}
