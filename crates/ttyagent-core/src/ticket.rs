//! Single-use, TTL-bound WebSocket tickets.
//!
//! A ticket binds a validated `(kubeconfig, target)` pair to a future
//! WebSocket connection so that credentials never travel in the upgrade
//! URL. Tickets are process-local: a restart invalidates all of them.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

use crate::target::ExecTarget;

/// Why a ticket could not be consumed. The display strings are part of
/// the client-facing protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConsumeError {
    #[error("Invalid or expired ticket.")]
    Invalid,
    #[error("Ticket already used.")]
    Used,
    #[error("Ticket expired.")]
    Expired,
}

/// Who requested the ticket, recorded for the audit log line.
#[derive(Debug, Clone)]
pub struct IssuerMeta {
    pub remote_addr: String,
    pub user_agent: Option<String>,
}

/// Who presented the ticket on the WebSocket side.
#[derive(Debug, Clone)]
pub struct ConsumerMeta {
    pub remote_addr: String,
}

/// The client-visible result of issuing a ticket.
#[derive(Debug, Clone)]
pub struct IssuedTicket {
    pub ticket: String,
    /// Wall-clock expiry, milliseconds since the Unix epoch.
    pub expires_at: u64,
}

struct TicketEntry {
    /// Taken (and thereby dropped from memory) at consumption; the rest
    /// of the entry stays behind as a used tombstone until the TTL sweep.
    kubeconfig: Option<String>,
    target: ExecTarget,
    expires_at: Instant,
    used: bool,
    issuer: IssuerMeta,
}

/// Store of outstanding tickets. `consume` is atomic per ticket: the
/// check, the used mark, and the credential take happen under one map
/// entry lock, so a ticket can be redeemed at most once.
pub struct TicketStore {
    entries: DashMap<String, TicketEntry>,
    ttl: Duration,
}

impl TicketStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Issues a fresh single-use ticket for `target`.
    pub fn issue(&self, kubeconfig: String, target: ExecTarget, issuer: IssuerMeta) -> IssuedTicket {
        let ticket = uuid::Uuid::new_v4().to_string();
        let expires_at_ms = unix_millis().saturating_add(self.ttl.as_millis() as u64);
        tracing::info!(
            ticket = %ticket,
            remote = %issuer.remote_addr,
            namespace = %target.namespace,
            pod = %target.pod,
            "ticket issued"
        );
        self.entries.insert(
            ticket.clone(),
            TicketEntry {
                kubeconfig: Some(kubeconfig),
                target,
                expires_at: Instant::now() + self.ttl,
                used: false,
                issuer,
            },
        );
        self.sweep();
        IssuedTicket {
            ticket,
            expires_at: expires_at_ms,
        }
    }

    /// Redeems a ticket, returning the kubeconfig and target it was issued
    /// for. Succeeds at most once per ticket.
    pub fn consume(
        &self,
        ticket: &str,
        consumer: &ConsumerMeta,
    ) -> Result<(String, ExecTarget), ConsumeError> {
        let result = self.take(ticket);
        self.sweep();
        match &result {
            Ok((_, target)) => tracing::info!(
                ticket = %ticket,
                remote = %consumer.remote_addr,
                namespace = %target.namespace,
                pod = %target.pod,
                "ticket consumed"
            ),
            Err(reason) => tracing::warn!(
                ticket = %ticket,
                remote = %consumer.remote_addr,
                "ticket rejected: {reason}"
            ),
        }
        result
    }

    fn take(&self, ticket: &str) -> Result<(String, ExecTarget), ConsumeError> {
        let Some(mut entry) = self.entries.get_mut(ticket) else {
            return Err(ConsumeError::Invalid);
        };
        if Instant::now() >= entry.expires_at {
            // A used tombstone past its TTL is indistinguishable from a
            // ticket that never existed.
            let was_used = entry.used;
            drop(entry);
            self.entries.remove(ticket);
            return Err(if was_used {
                ConsumeError::Invalid
            } else {
                ConsumeError::Expired
            });
        }
        if entry.used {
            return Err(ConsumeError::Used);
        }
        entry.used = true;
        let kubeconfig = entry.kubeconfig.take().ok_or(ConsumeError::Used)?;
        let target = entry.target.clone();
        tracing::debug!(issuer = %entry.issuer.remote_addr, "ticket redeemed");
        Ok((kubeconfig, target))
    }

    /// Removes every record past its expiry, used tombstones included.
    /// Runs on each issue/consume call, so no background task is needed.
    fn sweep(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| now < entry.expires_at);
    }

    /// Number of records currently held (live tickets plus tombstones).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> ExecTarget {
        ExecTarget::new("default", "my-pod", Some("main"), None).unwrap()
    }

    fn issuer() -> IssuerMeta {
        IssuerMeta {
            remote_addr: "10.0.0.1:5000".to_string(),
            user_agent: Some("test-agent".to_string()),
        }
    }

    fn consumer() -> ConsumerMeta {
        ConsumerMeta {
            remote_addr: "10.0.0.1:5001".to_string(),
        }
    }

    #[test]
    fn consume_succeeds_once() {
        let store = TicketStore::new(Duration::from_secs(60));
        let issued = store.issue("kubeconfig-bytes".to_string(), target(), issuer());

        let (kubeconfig, target) = store.consume(&issued.ticket, &consumer()).unwrap();
        assert_eq!(kubeconfig, "kubeconfig-bytes");
        assert_eq!(target.pod, "my-pod");

        assert_eq!(
            store.consume(&issued.ticket, &consumer()),
            Err(ConsumeError::Used)
        );
    }

    #[test]
    fn unknown_ticket_is_invalid() {
        let store = TicketStore::new(Duration::from_secs(60));
        assert_eq!(
            store.consume("no-such-ticket", &consumer()),
            Err(ConsumeError::Invalid)
        );
    }

    #[test]
    fn expired_ticket_is_reported_then_gone() {
        let store = TicketStore::new(Duration::from_millis(5));
        let issued = store.issue("kc".to_string(), target(), issuer());

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(
            store.consume(&issued.ticket, &consumer()),
            Err(ConsumeError::Expired)
        );
        // The expired record was removed; a replay is indistinguishable
        // from a ticket that never existed.
        assert_eq!(
            store.consume(&issued.ticket, &consumer()),
            Err(ConsumeError::Invalid)
        );
    }

    #[test]
    fn issue_sweeps_expired_records() {
        let store = TicketStore::new(Duration::from_millis(5));
        store.issue("a".to_string(), target(), issuer());
        store.issue("b".to_string(), target(), issuer());
        assert_eq!(store.len(), 2);

        std::thread::sleep(Duration::from_millis(20));
        store.issue("c".to_string(), target(), issuer());
        // The two expired records were swept on issue.
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn used_tombstone_expires_into_invalid() {
        let store = TicketStore::new(Duration::from_millis(30));
        let issued = store.issue("kc".to_string(), target(), issuer());
        store.consume(&issued.ticket, &consumer()).unwrap();
        assert_eq!(
            store.consume(&issued.ticket, &consumer()),
            Err(ConsumeError::Used)
        );

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(
            store.consume(&issued.ticket, &consumer()),
            Err(ConsumeError::Invalid)
        );
    }

    #[test]
    fn ticket_ids_are_unique() {
        let store = TicketStore::new(Duration::from_secs(60));
        let a = store.issue("kc".to_string(), target(), issuer());
        let b = store.issue("kc".to_string(), target(), issuer());
        assert_ne!(a.ticket, b.ticket);
        uuid::Uuid::parse_str(&a.ticket).unwrap();
    }

    #[test]
    fn error_messages_are_client_facing() {
        assert_eq!(ConsumeError::Invalid.to_string(), "Invalid or expired ticket.");
        assert_eq!(ConsumeError::Used.to_string(), "Ticket already used.");
        assert_eq!(ConsumeError::Expired.to_string(), "Ticket expired.");
    }

    #[test]
    fn expires_at_is_in_the_future() {
        let store = TicketStore::new(Duration::from_secs(60));
        let before = unix_millis();
        let issued = store.issue("kc".to_string(), target(), issuer());
        assert!(issued.expires_at >= before + 60_000);
    }
}
