//! Postman: the in-process name-based message router.
//!
//! Cyclic references between actors (Master ↔ workers, Bot manager ↔
//! monitors) are broken by routing every inter-actor message through this
//! registry; components hold only an opaque [`MailId`] for their peers.
//! Registration is synchronous (a direct call, not mail) to avoid a
//! circular "register-via-mail" race; everything else is mail.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::mail::{Mail, MailBody, MailId, PRIORITY_INVALID_RECIPIENT};

/// The own mail id the Postman answers control mail under.
pub const POSTMAN_ID: &str = "postman";

/// Anything that can receive routed mail.
///
/// Dispatching `receive` always happens on a freshly spawned task so a
/// slow recipient cannot stall the router.
pub trait MailClient: Send + Sync {
    fn receive(&self, mail: Mail);
}

#[derive(Debug, thiserror::Error)]
pub enum PostmanError {
    #[error("mail client already registered: {0}")]
    AlreadyRegistered(MailId),
}

/// The message router. Cloning shares the same registry.
#[derive(Clone)]
pub struct Postman {
    clients: Arc<DashMap<MailId, Arc<dyn MailClient>>>,
}

impl Default for Postman {
    fn default() -> Self {
        Self::new()
    }
}

impl Postman {
    pub fn new() -> Self {
        Self {
            clients: Arc::new(DashMap::new()),
        }
    }

    /// Synchronously registers `client` under `id`. Fails if `id` is
    /// already bound — re-registration must go through
    /// [`Postman::unregister`] first.
    pub fn register(&self, id: impl Into<MailId>, client: Arc<dyn MailClient>) -> Result<(), PostmanError> {
        let id = id.into();
        if self.clients.contains_key(&id) {
            return Err(PostmanError::AlreadyRegistered(id));
        }
        debug!(mail_id = %id, "registered mail client");
        self.clients.insert(id, client);
        Ok(())
    }

    /// Removes a registered client. Idempotent.
    pub fn unregister(&self, id: &str) {
        if self.clients.remove(id).is_some() {
            debug!(mail_id = %id, "unregistered mail client");
        }
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.clients.contains_key(id)
    }

    /// Routes one piece of mail. If `to` is absent from the registry and
    /// `from` is not the Postman itself, posts back an
    /// `InvalidMailClient(to)` notice to `from`.
    ///
    /// Delivery to the resolved recipient runs on a fresh `tokio::spawn`
    /// so a slow `receive` cannot stall routing of subsequent mail.
    pub fn route(&self, mail: Mail) {
        if mail.to == POSTMAN_ID {
            self.handle_control(mail);
            return;
        }

        match self.clients.get(&mail.to) {
            Some(client) => {
                let client = Arc::clone(&client);
                tokio::spawn(async move {
                    client.receive(mail);
                });
            }
            None => {
                warn!(to = %mail.to, from = %mail.from, "no such mail client");
                if mail.from != POSTMAN_ID {
                    if let Some(sender) = self.clients.get(&mail.from) {
                        let sender = Arc::clone(&sender);
                        let notice = Mail::new(
                            POSTMAN_ID,
                            mail.from.clone(),
                            MailBody::InvalidMailClient(mail.to.clone()),
                            PRIORITY_INVALID_RECIPIENT,
                        );
                        tokio::spawn(async move {
                            sender.receive(notice);
                        });
                    }
                }
            }
        }
    }

    fn handle_control(&self, mail: Mail) {
        debug!(from = %mail.from, "postman received control mail");
        // The only control body currently defined is an unregister request
        // carried as `Control { "op": "unregister", "id": ... }`.
        if let MailBody::Control(fields) = &mail.body {
            if fields.get("op").map(String::as_str) == Some("unregister") {
                if let Some(id) = fields.get("id") {
                    self.unregister(id);
                }
            }
        }
    }
}
