//! Long-running workers of the daemon. Each one owns its queue and is reached through an [Addr].

use tokio::sync::mpsc;

pub mod announcer;
pub mod control_handler;
pub mod dispatcher;
pub mod forwarder;
pub mod injector;

#[derive(Debug, Clone)]
pub struct Addr<Message> {
    sender: mpsc::Sender<Message>,
}

impl<Message> Addr<Message> {
    pub fn new(sender: mpsc::Sender<Message>) -> Self {
        Self { sender }
    }
    pub async fn send_message(&self, message: Message) {
        let _ = self.sender.send(message).await;
    }
    /// Delivers `message` only if the actor's queue has room. Returns whether it was queued.
    pub fn try_send_message(&self, message: Message) -> bool {
        self.sender.try_send(message).is_ok()
    }
}

pub trait Actor<Message>: Send + Sync
where
    Message: Send,
{
    fn get_addr(&self) -> Addr<Message>;
}
