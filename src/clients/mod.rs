//! External collaborators: the notification service and the tenant data store.

mod db;
mod notification;

pub use db::{DbClient, FieldTarget, SqliteDbClient};
pub use notification::{
    DispatchReceipt, DryRunNotificationClient, EmailBatch, EmailMessage, HttpNotificationClient,
    NotificationClient, WhatsAppBatch, WhatsAppMessage,
};
