//! Authentication
//!
//! [`AuthNegotiator`] is the sole driver of method selection. It walks an
//! [`AuthPlan`] built from the profile and the credentials found locally,
//! against anything implementing [`AuthTransport`].

mod negotiator;
mod transport;

use std::collections::VecDeque;
use std::fmt;

use crate::ssh::AuthKind;

pub use negotiator::AuthNegotiator;
pub use transport::{Attempt, AuthTransport, KbiPrompt, KbiStep};

/// One candidate in the fallback chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    None,
    PublicKey,
    Agent,
    Password,
    KeyboardInteractive,
    HostBased,
}

impl AuthMethod {
    /// Method name as it appears on the wire
    pub fn name(self) -> &'static str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::PublicKey => "publickey",
            AuthMethod::Agent => "agent",
            AuthMethod::Password => "password",
            AuthMethod::KeyboardInteractive => "keyboard-interactive",
            AuthMethod::HostBased => "hostbased",
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Ordered candidate list, consumed front to back
#[derive(Debug, Clone)]
pub struct AuthPlan {
    queue: VecDeque<AuthMethod>,
}

impl AuthPlan {
    /// `none` first, then publickey, agent, password, keyboard-interactive
    /// and hostbased. A pin keeps only `none` and the pinned method.
    pub fn build(pin: Option<AuthKind>, has_key: bool, has_agent: bool) -> Self {
        let allows = |kind: AuthKind| pin.map_or(true, |p| p == kind);

        let mut queue = VecDeque::from([AuthMethod::None]);
        if has_key && allows(AuthKind::PublicKey) {
            queue.push_back(AuthMethod::PublicKey);
        }
        if has_agent && allows(AuthKind::Agent) {
            queue.push_back(AuthMethod::Agent);
        }
        if allows(AuthKind::Password) {
            queue.push_back(AuthMethod::Password);
        }
        if allows(AuthKind::KeyboardInteractive) {
            queue.push_back(AuthMethod::KeyboardInteractive);
        }
        if pin.is_none() {
            queue.push_back(AuthMethod::HostBased);
        }

        Self { queue }
    }

    /// Pop the next candidate the server still accepts. Agent is never
    /// skipped: servers leave it out of their lists but still take it.
    pub fn next(&mut self, server_allowed: Option<&[AuthMethod]>) -> Option<AuthMethod> {
        while let Some(method) = self.queue.pop_front() {
            match server_allowed {
                Some(allowed) if method != AuthMethod::Agent && !allowed.contains(&method) => {
                    tracing::info!("Server does not support auth method {}", method);
                }
                _ => return Some(method),
            }
        }
        None
    }

    pub fn remaining(&self) -> Vec<AuthMethod> {
        self.queue.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_order() {
        let plan = AuthPlan::build(None, true, true);
        assert_eq!(
            plan.remaining(),
            vec![
                AuthMethod::None,
                AuthMethod::PublicKey,
                AuthMethod::Agent,
                AuthMethod::Password,
                AuthMethod::KeyboardInteractive,
                AuthMethod::HostBased,
            ]
        );
    }

    #[test]
    fn test_missing_credentials_are_left_out() {
        let plan = AuthPlan::build(None, false, false);
        assert_eq!(
            plan.remaining(),
            vec![
                AuthMethod::None,
                AuthMethod::Password,
                AuthMethod::KeyboardInteractive,
                AuthMethod::HostBased,
            ]
        );
    }

    #[test]
    fn test_pin_offers_only_none_and_pinned() {
        for (pin, method) in [
            (AuthKind::Password, AuthMethod::Password),
            (AuthKind::PublicKey, AuthMethod::PublicKey),
            (AuthKind::Agent, AuthMethod::Agent),
            (AuthKind::KeyboardInteractive, AuthMethod::KeyboardInteractive),
        ] {
            let plan = AuthPlan::build(Some(pin), true, true);
            assert_eq!(plan.remaining(), vec![AuthMethod::None, method]);
        }
        assert_eq!(
            AuthPlan::build(Some(AuthKind::None), true, true).remaining(),
            vec![AuthMethod::None]
        );
    }

    #[test]
    fn test_server_list_skips_but_keeps_agent() {
        let mut plan = AuthPlan::build(None, true, true);
        let allowed = [AuthMethod::KeyboardInteractive];

        assert_eq!(plan.next(None), Some(AuthMethod::None));
        assert_eq!(plan.next(Some(&allowed)), Some(AuthMethod::Agent));
        assert_eq!(plan.next(Some(&allowed)), Some(AuthMethod::KeyboardInteractive));
        assert_eq!(plan.next(Some(&allowed)), None);
    }
}
