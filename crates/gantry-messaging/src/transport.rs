use crate::channel::Channel;
use crate::message::Message;
use crate::queue::MessageQueue;
use crate::MessagingError;

/// A connection to a pub/sub transport.
///
/// Delivery into the bound `MessageQueue` happens on the transport's own
/// threads; all methods take `&self` so a client can be shared between a
/// message handler and its runtime.
pub trait MessagingClient: Send + Sync {
    fn transport_type(&self) -> &str;

    fn open_connection(&self) -> Result<(), MessagingError>;

    /// Close the connection and drop every subscription. Idempotent.
    fn close_connection(&self) -> Result<(), MessagingError>;

    fn is_connected(&self) -> bool;

    fn publish(&self, channel: &Channel, message: &Message) -> Result<(), MessagingError>;

    fn subscribe(&self, channel: &Channel) -> Result<(), MessagingError>;

    fn unsubscribe(&self, channel: &Channel) -> Result<(), MessagingError>;

    /// Bind the queue inbound messages are delivered to.
    fn set_message_queue(&self, queue: MessageQueue);

    /// Remove every broker-side topic and binding of `application`.
    fn delete_messaging_server_artifacts(&self, application: &str) -> Result<(), MessagingError>;
}
