//! Login scripts
//!
//! Expect/send automation over the shell output. Scripts are consumed in
//! list order: a required script blocks everything after it until its
//! text shows up, an optional one is dropped as soon as a pass misses it.

use std::collections::VecDeque;
use std::time::Duration;

use regex::Regex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::ssh::{LoginScript, ScriptError};

/// Output kept for matching while waiting on a script
const MAX_BUFFER: usize = 8 * 1024;

#[derive(Debug, Clone)]
enum Matcher {
    Literal(String),
    Pattern(Regex),
}

/// A pending script with its pattern compiled
#[derive(Debug, Clone)]
pub struct PendingScript {
    matcher: Matcher,
    send: String,
    optional: bool,
}

impl PendingScript {
    pub fn compile(script: &LoginScript) -> Result<Self, ScriptError> {
        let matcher = if script.is_regex {
            Matcher::Pattern(Regex::new(&script.expect).map_err(|e| {
                ScriptError::InvalidPattern {
                    pattern: script.expect.clone(),
                    reason: e.to_string(),
                }
            })?)
        } else {
            Matcher::Literal(script.expect.clone())
        };
        Ok(Self {
            matcher,
            send: script.send.clone(),
            optional: script.optional,
        })
    }

    pub fn expect(&self) -> &str {
        match &self.matcher {
            Matcher::Literal(text) => text,
            Matcher::Pattern(re) => re.as_str(),
        }
    }

    pub fn is_unconditional(&self) -> bool {
        self.expect().is_empty()
    }

    /// The command to send if `output` satisfies this script
    fn command_for(&self, output: &str) -> Option<String> {
        match &self.matcher {
            Matcher::Literal(text) => output.contains(text.as_str()).then(|| self.send.clone()),
            Matcher::Pattern(re) => re
                .is_match(output)
                .then(|| re.replace_all(output, self.send.as_str()).into_owned()),
        }
    }
}

/// Result of one pass over the pending list
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScriptPass {
    /// Commands to send, in order, without line endings
    pub commands: Vec<String>,
    /// At least one script matched
    pub matched: bool,
    /// Some script left the list (matched or skipped)
    pub progressed: bool,
}

/// Send every unconditional script at the head of the list
pub fn take_unconditional(pending: &mut VecDeque<PendingScript>) -> Vec<String> {
    let mut commands = Vec::new();
    while pending.front().is_some_and(PendingScript::is_unconditional) {
        if let Some(script) = pending.pop_front() {
            info!("Executing script: \"{}\"", script.send);
            commands.push(script.send);
        }
    }
    commands
}

/// Match `output` against the pending list and remove what it consumes
pub fn run_scripts(pending: &mut VecDeque<PendingScript>, output: &str) -> ScriptPass {
    let mut pass = ScriptPass::default();

    while let Some(script) = pending.front() {
        match script.command_for(output) {
            Some(command) => {
                info!("Executing script: \"{}\"", command);
                pass.commands.push(command);
                pass.matched = true;
                pass.progressed = true;
                pending.pop_front();
            }
            None if script.optional => {
                debug!("Skip optional script: {}", script.expect());
                pass.progressed = true;
                pending.pop_front();
            }
            None => break,
        }
    }

    if pass.progressed {
        pass.commands.extend(take_unconditional(pending));
    }
    pass
}

/// Per-shell script state: the pending list, the output seen since the
/// last match and the deadline for the script at the head.
///
/// The deadline is armed only while a script waits on output, restarts on
/// every pass that makes progress and never arms without a timeout.
#[derive(Debug, Default)]
pub struct LoginScriptRunner {
    pending: VecDeque<PendingScript>,
    buffer: String,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
}

impl LoginScriptRunner {
    pub fn new(scripts: &[LoginScript]) -> Result<Self, ScriptError> {
        let pending = scripts
            .iter()
            .map(PendingScript::compile)
            .collect::<Result<VecDeque<_>, _>>()?;
        Ok(Self {
            pending,
            ..Self::default()
        })
    }

    /// `None` disables the deadline
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Commands that fire before any output arrives
    pub fn start(&mut self) -> Vec<String> {
        let commands = take_unconditional(&mut self.pending);
        self.rearm(true);
        commands
    }

    pub fn feed(&mut self, chunk: &[u8]) -> ScriptPass {
        if self.pending.is_empty() {
            return ScriptPass::default();
        }

        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        if self.buffer.len() > MAX_BUFFER {
            let mut cut = self.buffer.len() - MAX_BUFFER;
            while !self.buffer.is_char_boundary(cut) {
                cut += 1;
            }
            self.buffer.drain(..cut);
        }

        let pass = run_scripts(&mut self.pending, &self.buffer);
        if pass.matched {
            self.buffer.clear();
        }
        self.rearm(pass.progressed);
        pass
    }

    fn rearm(&mut self, progressed: bool) {
        let waiting = self.waiting_for().is_some_and(|e| !e.is_empty());
        match (waiting, self.timeout) {
            (true, Some(timeout)) if progressed || self.deadline.is_none() => {
                self.deadline = Some(Instant::now() + timeout);
            }
            (true, _) => {}
            (false, _) => self.deadline = None,
        }
    }

    /// When the head script gives up, if it is waiting
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Abandon the remaining scripts once the deadline has passed
    pub fn expire(&mut self, now: Instant) -> Option<ScriptError> {
        match self.deadline {
            Some(at) if now >= at => self.abandon(),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.pending.is_empty()
    }

    /// Text the head script is waiting for
    pub fn waiting_for(&self) -> Option<&str> {
        self.pending.front().map(PendingScript::expect)
    }

    /// Give up on the remaining scripts
    pub fn abandon(&mut self) -> Option<ScriptError> {
        self.deadline = None;
        let expect = self.waiting_for()?.to_string();
        self.pending.clear();
        self.buffer.clear();
        Some(ScriptError::Timeout { expect })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner(scripts: Vec<LoginScript>) -> LoginScriptRunner {
        LoginScriptRunner::new(&scripts).unwrap()
    }

    #[test]
    fn test_login_then_unconditional() {
        let mut r = runner(vec![LoginScript::new("login:", "bob"), LoginScript::new("", "ls")]);
        assert!(r.start().is_empty());

        let pass = r.feed(b"Welcome\r\nlogin: ");
        assert_eq!(pass.commands, vec!["bob", "ls"]);
        assert!(r.is_done());
    }

    #[test]
    fn test_unconditional_at_start() {
        let mut r = runner(vec![
            LoginScript::new("", "first"),
            LoginScript::new("", "second"),
            LoginScript::new("$ ", "third"),
        ]);
        assert_eq!(r.start(), vec!["first", "second"]);
        assert_eq!(r.waiting_for(), Some("$ "));
    }

    #[test]
    fn test_regex_sends_substitution() {
        let mut r = runner(vec![LoginScript::regex(r"Token: (\d+)", "otp $1")]);
        let pass = r.feed(b"Token: 4821");
        assert_eq!(pass.commands, vec!["otp 4821"]);
    }

    #[test]
    fn test_required_script_blocks() {
        let mut r = runner(vec![
            LoginScript::new("password:", "secret"),
            LoginScript::new("$ ", "ls"),
        ]);
        let pass = r.feed(b"user@host $ ");
        assert!(pass.commands.is_empty());
        assert!(!pass.progressed);
        assert_eq!(r.waiting_for(), Some("password:"));
    }

    #[test]
    fn test_optional_scripts_dropped() {
        let mut r = runner(vec![
            LoginScript::new("motd", "x").optional(),
            LoginScript::new("banner", "y").optional(),
            LoginScript::new("$ ", "ls"),
        ]);
        let pass = r.feed(b"nothing yet");
        assert!(pass.commands.is_empty());
        assert!(pass.progressed);
        assert_eq!(r.waiting_for(), Some("$ "));

        assert_eq!(r.feed(b"$ ").commands, vec!["ls"]);
    }

    #[test]
    fn test_sent_at_most_once() {
        let mut r = runner(vec![LoginScript::new("login:", "bob")]);
        assert_eq!(r.feed(b"login: ").commands, vec!["bob"]);
        assert!(r.feed(b"login: ").commands.is_empty());
    }

    #[test]
    fn test_prompt_split_across_chunks() {
        let mut r = runner(vec![LoginScript::new("Password:", "pw")]);
        assert!(r.feed(b"Pass").commands.is_empty());
        assert_eq!(r.feed(b"word: ").commands, vec!["pw"]);
    }

    #[test]
    fn test_several_scripts_in_one_chunk() {
        let mut pending: VecDeque<PendingScript> = [
            LoginScript::new("a", "1"),
            LoginScript::new("b", "2"),
            LoginScript::new("z", "3"),
        ]
        .iter()
        .map(|s| PendingScript::compile(s).unwrap())
        .collect();

        let pass = run_scripts(&mut pending, "a b c");
        assert_eq!(pass.commands, vec!["1", "2"]);
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_abandon_reports_expect() {
        let mut r = runner(vec![LoginScript::new("login:", "bob")]);
        assert_eq!(
            r.abandon(),
            Some(ScriptError::Timeout {
                expect: "login:".into()
            })
        );
        assert!(r.is_done());
        assert_eq!(r.abandon(), None);
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(matches!(
            LoginScriptRunner::new(&[LoginScript::regex("(", "x")]),
            Err(ScriptError::InvalidPattern { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_armed_while_waiting() {
        let mut r = runner(vec![LoginScript::new("login:", "bob")])
            .with_timeout(Some(Duration::from_secs(30)));
        assert_eq!(r.deadline(), None);

        r.start();
        let armed = r.deadline().unwrap();
        assert_eq!(armed, Instant::now() + Duration::from_secs(30));

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(r.expire(Instant::now()), None);
        assert!(!r.is_done());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(
            r.expire(Instant::now()),
            Some(ScriptError::Timeout {
                expect: "login:".into()
            })
        );
        assert!(r.is_done());
        assert_eq!(r.deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_restarts_deadline() {
        let mut r = runner(vec![
            LoginScript::new("login:", "bob"),
            LoginScript::new("Password:", "secret"),
        ])
        .with_timeout(Some(Duration::from_secs(10)));
        r.start();
        let first = r.deadline().unwrap();

        // Output without a match keeps the clock running
        tokio::time::advance(Duration::from_secs(4)).await;
        r.feed(b"Welcome\r\n");
        assert_eq!(r.deadline(), Some(first));

        tokio::time::advance(Duration::from_secs(4)).await;
        r.feed(b"login: ");
        assert_eq!(r.deadline(), Some(Instant::now() + Duration::from_secs(10)));

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(r.expire(Instant::now()), None);

        r.feed(b"Password: ");
        assert!(r.is_done());
        assert_eq!(r.deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_timeout_never_expires() {
        let mut r = runner(vec![LoginScript::new("login:", "bob")]).with_timeout(None);
        r.start();
        r.feed(b"banner");
        assert_eq!(r.deadline(), None);

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(r.expire(Instant::now()), None);
        assert_eq!(r.waiting_for(), Some("login:"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconditional_only_never_arms() {
        let mut r = runner(vec![LoginScript::new("", "ls")])
            .with_timeout(Some(Duration::from_secs(5)));
        assert_eq!(r.start(), vec!["ls"]);
        assert_eq!(r.deadline(), None);
    }
}
