//! In-memory credential and topic permission ledger.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::broker::{Authenticator, ConnInfo};
use crate::error::{Error, Result};
use crate::topic;

/// Operator account allowed from anywhere.
const ADMIN_USERNAME: &str = "arx7";
const ADMIN_PASSWORD: &str = "arbalest";
/// Operator account allowed from the loopback address only.
const LOCAL_ADMIN_USERNAME: &str = "YoRHa";
const LOCAL_ADMIN_PASSWORD: &str = "no2typeB";
const LOOPBACK: &str = "127.0.0.1";

/// Access level granted by an ACL rule.
///
/// Serialized as its integer code (0-3) in auth files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Access {
    /// No access to the topic.
    Deny = 0,
    /// Subscribe only.
    ReadOnly = 1,
    /// Publish only.
    WriteOnly = 2,
    /// Publish and subscribe.
    ReadWrite = 3,
}

impl Access {
    /// Whether this access level permits `op`.
    pub fn permits(self, op: Operation) -> bool {
        matches!(
            (self, op),
            (Access::ReadOnly | Access::ReadWrite, Operation::Subscribe)
                | (Access::WriteOnly | Access::ReadWrite, Operation::Publish)
        )
    }
}

impl TryFrom<u8> for Access {
    type Error = String;

    fn try_from(code: u8) -> std::result::Result<Self, Self::Error> {
        match code {
            0 => Ok(Access::Deny),
            1 => Ok(Access::ReadOnly),
            2 => Ok(Access::WriteOnly),
            3 => Ok(Access::ReadWrite),
            other => Err(format!("access code must be 0-3, got {other}")),
        }
    }
}

impl From<Access> for u8 {
    fn from(access: Access) -> Self {
        access as u8
    }
}

/// Topic operation being authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Subscribe,
    Publish,
}

/// Topic filter to access level mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclRule {
    pub filter: String,
    pub access: Access,
}

impl AclRule {
    pub fn new(filter: impl Into<String>, access: Access) -> Self {
        Self {
            filter: filter.into(),
            access,
        }
    }
}

/// Connection admission rule.
///
/// Empty fields (or `*`) are wildcards. A value ending in `*` matches by
/// prefix, so `192.168.*` admits a whole subnet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuthRule {
    pub username: String,
    pub password: String,
    pub remote: String,
    pub allow: bool,
}

impl AuthRule {
    /// Rule allowing `username`/`password` from any address.
    pub fn allow(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            remote: String::new(),
            allow: true,
        }
    }

    /// Rule denying `username` regardless of password or address.
    pub fn deny(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            ..Self::default()
        }
    }

    /// Restrict the rule to a remote address pattern.
    pub fn with_remote(mut self, remote: impl Into<String>) -> Self {
        self.remote = remote.into();
        self
    }

    fn matches(&self, username: &str, password: &str, remote: &str) -> bool {
        field_matches(&self.username, username)
            && field_matches(&self.password, password)
            && field_matches(&self.remote, remote)
    }
}

fn field_matches(rule: &str, value: &str) -> bool {
    if rule.is_empty() || rule == "*" || rule == value {
        return true;
    }
    rule.strip_suffix('*')
        .is_some_and(|prefix| !prefix.is_empty() && value.starts_with(prefix))
}

/// A known user with per-user topic rules.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct User {
    pub username: String,
    pub password: String,
    /// Per-user rules, in declaration order.
    pub acl: Vec<AclRule>,
    /// Disallowed users never authenticate.
    pub disallow: bool,
}

impl User {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            ..Self::default()
        }
    }

    pub fn with_acl(mut self, filter: impl Into<String>, access: Access) -> Self {
        self.acl.push(AclRule::new(filter, access));
        self
    }

    pub fn disallowed(mut self) -> Self {
        self.disallow = true;
        self
    }
}

/// Authorization store: users, connection rules and global topic rules.
///
/// A ledger is read-only once installed into a broker; reconfiguring means
/// building a new one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ledger {
    pub users: BTreeMap<String, User>,
    /// Connection rules, first match wins.
    pub auth: Vec<AuthRule>,
    /// Global topic rules used when a user has no matching rule of its own.
    pub acl: Vec<AclRule>,
}

impl Ledger {
    /// Empty ledger: no users, no rules.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a user, replacing any existing user with the same name.
    pub fn with_user(mut self, user: User) -> Self {
        self.users.insert(user.username.clone(), user);
        self
    }

    pub fn with_auth_rule(mut self, rule: AuthRule) -> Self {
        self.auth.push(rule);
        self
    }

    pub fn with_acl_rule(mut self, filter: impl Into<String>, access: Access) -> Self {
        self.acl.push(AclRule::new(filter, access));
        self
    }

    /// The built-in sample ledger written by `initauth`.
    ///
    /// Returns a fresh value on every call.
    pub fn sample() -> Self {
        Self::new()
            .with_user(
                User::new("thisisanACLsample", "lostjudgment")
                    .with_acl("deny/#", Access::Deny)
                    .with_acl("read/#", Access::ReadOnly)
                    .with_acl("write/#", Access::WriteOnly)
                    .with_acl("rw/#", Access::ReadWrite)
                    .disallowed(),
            )
            .with_user(
                User::new("control", "dayone")
                    .with_acl("down/#", Access::ReadWrite)
                    .with_acl("up/#", Access::ReadWrite),
            )
            .with_user(
                User::new("user01", "fallguys")
                    .with_acl("down/+/user01/#", Access::ReadOnly)
                    .with_acl("up/+/user01/#", Access::WriteOnly)
                    .with_acl("up/#", Access::Deny),
            )
    }

    /// The two operator rules appended to every installed ledger.
    pub fn admin_rules() -> [AuthRule; 2] {
        [
            AuthRule::allow(ADMIN_USERNAME, ADMIN_PASSWORD),
            AuthRule::allow(LOCAL_ADMIN_USERNAME, LOCAL_ADMIN_PASSWORD).with_remote(LOOPBACK),
        ]
    }

    /// Append the operator rules after every existing connection rule.
    ///
    /// Rules are first-match-wins, so an earlier rule naming the same
    /// account still takes precedence.
    pub fn with_admin_rules(mut self) -> Self {
        self.auth.extend(Self::admin_rules());
        self
    }

    /// Check that every filter is well formed and users are keyed by name.
    pub fn validate(&self) -> Result<()> {
        for (name, user) in &self.users {
            if *name != user.username {
                return Err(Error::InvalidConfig(format!(
                    "user keyed as {name} is named {}",
                    user.username
                )));
            }
            for rule in &user.acl {
                topic::validate_filter(&rule.filter)?;
            }
        }
        for rule in &self.acl {
            topic::validate_filter(&rule.filter)?;
        }
        Ok(())
    }

    /// Decide whether a connection may be admitted.
    ///
    /// Disallowed users are refused outright. Otherwise the first connection
    /// rule matching all of its non-empty fields decides; failing that the
    /// user table is consulted, and anything else is denied.
    pub fn authenticate_connection(&self, username: &str, password: &str, remote: &str) -> bool {
        let user = self.users.get(username);
        if user.is_some_and(|u| u.disallow) {
            return false;
        }

        if let Some(rule) = self
            .auth
            .iter()
            .find(|rule| rule.matches(username, password, remote))
        {
            return rule.allow;
        }

        user.is_some_and(|u| !u.password.is_empty() && u.password == password)
    }

    /// Decide whether `username` may perform `op` on `topic`.
    ///
    /// The user's own rules are searched first, then the global rules; the
    /// most specific matching filter decides. No match means deny.
    pub fn authorize_topic(&self, username: &str, topic: &str, op: Operation) -> bool {
        let user_rule = self
            .users
            .get(username)
            .and_then(|user| most_specific(&user.acl, topic));

        match user_rule.or_else(|| most_specific(&self.acl, topic)) {
            Some(rule) => rule.access.permits(op),
            None => false,
        }
    }
}

/// Most specific rule matching `topic`, earliest declared on ties.
fn most_specific<'a>(rules: &'a [AclRule], topic: &str) -> Option<&'a AclRule> {
    let mut best: Option<(usize, &AclRule)> = None;
    for rule in rules.iter().filter(|rule| topic::matches(topic, &rule.filter)) {
        let score = topic::specificity(&rule.filter);
        if best.is_none_or(|(top, _)| score > top) {
            best = Some((score, rule));
        }
    }
    best.map(|(_, rule)| rule)
}

impl Authenticator for Ledger {
    fn authenticate(&self, conn: &ConnInfo, password: &[u8]) -> bool {
        let password = String::from_utf8_lossy(password);
        // Dual-stack sockets report IPv4 peers as ::ffff:a.b.c.d.
        let remote = conn.remote.ip().to_canonical().to_string();
        self.authenticate_connection(&conn.username, &password, &remote)
    }

    fn acl(&self, conn: &ConnInfo, topic: &str, write: bool) -> bool {
        let op = if write {
            Operation::Publish
        } else {
            Operation::Subscribe
        };
        self.authorize_topic(&conn.username, topic, op)
    }
}
