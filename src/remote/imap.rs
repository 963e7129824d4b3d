//! IMAP-backed remote inventory (blocking, TLS).
//!
//! Every mailbox is opened read-only with `EXAMINE`; headers and bodies are
//! fetched with `BODY.PEEK[...]` so the server-side `\Seen` flags are never
//! touched.

use std::net::TcpStream;
use std::time::Duration;

use native_tls::{TlsConnector, TlsStream};
use tracing::{debug, info};

use crate::config::{PacingConfig, ServerConfig};
use crate::error::{BackupError, Result};
use crate::model::message::{FetchedMessage, MessageRef};
use crate::parser::header;
use crate::remote::{FolderFilter, RemoteInventory};

type TlsSession = imap::Session<TlsStream<TcpStream>>;

/// Pauses after every `every` remote operations so rate-limited servers do
/// not drop the connection.
#[derive(Debug, Clone)]
pub struct Pacer {
    every: u64,
    pause: Duration,
    count: u64,
}

impl Pacer {
    pub fn new(config: &PacingConfig) -> Self {
        Self {
            every: config.sleep_after_messages,
            pause: Duration::from_secs(config.sleep_seconds),
            count: 0,
        }
    }

    /// Count one operation. Returns `true` when a pause is due.
    fn tick(&mut self) -> bool {
        if self.every == 0 {
            return false;
        }
        self.count += 1;
        self.count % self.every == 0
    }

    fn after_operation(&mut self) {
        if self.tick() && !self.pause.is_zero() {
            info!(
                operations = self.count,
                seconds = self.pause.as_secs(),
                "Pausing to respect server rate limits"
            );
            std::thread::sleep(self.pause);
        }
    }
}

/// A logged-in IMAP session used as [`RemoteInventory`].
pub struct ImapInventory {
    session: TlsSession,
    selected: Option<String>,
    pacer: Pacer,
}

impl ImapInventory {
    /// Connect over TLS and log in.
    pub fn connect(server: &ServerConfig, password: &str, pacing: &PacingConfig) -> Result<Self> {
        let host = server.host.as_str();
        let remote_error = |reason: String| BackupError::remote("connect", "", reason);

        let tls = TlsConnector::builder()
            .build()
            .map_err(|e| remote_error(e.to_string()))?;
        let client = imap::connect((host, server.port), host, &tls)
            .map_err(|e| remote_error(format!("{host}:{}: {e}", server.port)))?;
        let session = client
            .login(&server.username, password)
            .map_err(|(e, _)| remote_error(format!("login as {}: {e}", server.username)))?;

        info!(host = host, user = %server.username, "Connected to IMAP server");
        Ok(Self {
            session,
            selected: None,
            pacer: Pacer::new(pacing),
        })
    }

    /// Log out, ignoring errors from a connection that is already gone.
    pub fn logout(mut self) {
        if let Err(e) = self.session.logout() {
            debug!(error = %e, "Logout failed");
        }
    }

    /// Names of all selectable mailboxes, in server order.
    fn mailboxes(&mut self) -> Result<Vec<String>> {
        let names = self
            .session
            .list(Some(""), Some("*"))
            .map_err(|e| BackupError::remote("list", "*", e))?;
        Ok(names
            .iter()
            .filter(|n| !n.attributes().contains(&imap::types::NameAttribute::NoSelect))
            .map(|n| n.name().to_string())
            .collect())
    }

    fn examine(&mut self, folder: &str) -> Result<()> {
        if self.selected.as_deref() == Some(folder) {
            return Ok(());
        }
        self.session
            .examine(folder)
            .map_err(|e| BackupError::remote("examine", folder, e))?;
        self.selected = Some(folder.to_string());
        Ok(())
    }

    /// UIDs matching `query` in the selected folder, ascending.
    fn search(&mut self, folder: &str, query: &str) -> Result<Vec<u32>> {
        let mut uids: Vec<u32> = self
            .session
            .uid_search(query)
            .map_err(|e| BackupError::remote("search", folder, e))?
            .into_iter()
            .collect();
        uids.sort_unstable();
        Ok(uids)
    }

    fn fetch_headers(&mut self, folder: &str, uid: u32) -> Result<Option<MessageRef>> {
        let fetches = self
            .session
            .uid_fetch(uid.to_string(), "BODY.PEEK[HEADER]")
            .map_err(|e| BackupError::remote("fetch", folder, e))?;
        let reference = fetches
            .iter()
            .find_map(|f| f.header())
            .map(|raw| header::message_ref(folder, raw));
        self.pacer.after_operation();
        Ok(reference)
    }
}

impl RemoteInventory for ImapInventory {
    fn list_live(&mut self, filter: &FolderFilter) -> Result<Vec<MessageRef>> {
        let folders = match &filter.only {
            Some(folder) => vec![folder.clone()],
            None => self.mailboxes()?,
        };

        let mut refs = Vec::new();
        for folder in folders.iter().filter(|f| filter.admits(f)) {
            self.examine(folder)?;
            let uids = self.search(folder, "UNDELETED")?;
            info!(folder = %folder, messages = uids.len(), "Scanning folder");

            for uid in uids {
                match self.fetch_headers(folder, uid)? {
                    Some(reference) => refs.push(reference),
                    None => debug!(folder = %folder, uid = uid, "No header data returned"),
                }
            }
        }
        Ok(refs)
    }

    fn fetch_body(&mut self, folder: &str, message_id: &str) -> Result<FetchedMessage> {
        self.examine(folder)?;
        let query = format!("UNDELETED HEADER Message-ID {}", quote(message_id));
        let uid = self
            .search(folder, &query)?
            .into_iter()
            .next()
            .ok_or_else(|| {
                BackupError::remote("fetch", folder, format!("{message_id} not found"))
            })?;

        let fetches = self
            .session
            .uid_fetch(uid.to_string(), "BODY.PEEK[]")
            .map_err(|e| BackupError::remote("fetch", folder, e))?;
        let raw = fetches
            .iter()
            .find_map(|f| f.body())
            .map(<[u8]>::to_vec)
            .ok_or_else(|| {
                BackupError::remote("fetch", folder, format!("UID {uid}: empty body"))
            })?;
        self.pacer.after_operation();

        Ok(FetchedMessage::from_raw(folder, &raw))
    }
}

/// Quote a string for use in an IMAP command.
fn quote(s: &str) -> String {
    let escaped = s.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote() {
        assert_eq!(quote("<a@b>"), "\"<a@b>\"");
        assert_eq!(quote("we\"ird\\"), "\"we\\\"ird\\\\\"");
    }

    #[test]
    fn test_pacer_ticks() {
        let mut pacer = Pacer::new(&PacingConfig {
            sleep_after_messages: 3,
            sleep_seconds: 0,
        });
        let due: Vec<bool> = (0..6).map(|_| pacer.tick()).collect();
        assert_eq!(due, [false, false, true, false, false, true]);
    }

    #[test]
    fn test_pacer_disabled() {
        let mut pacer = Pacer::new(&PacingConfig {
            sleep_after_messages: 0,
            sleep_seconds: 30,
        });
        assert!((0..500).all(|_| !pacer.tick()));
    }
}
