//! YAML auth file.
//!
//! ```yaml
//! control:
//!     password: dayone
//!     acl:
//!         down/#: 3
//!         up/#: 3
//! ```
//!
//! Access codes: 0 deny, 1 subscribe only, 2 publish only, 3 both.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::ledger::{AclRule, Ledger, User};
use crate::error::Result;

const HEADER: &str = "\
# Filters access:
#   0 deny       user cannot access the topic
#   1 read only  user can only subscribe to the topic
#   2 write only user can only publish to the topic
#   3 read write user can both publish and subscribe to the topic
";

#[derive(Debug, Serialize, Deserialize)]
struct UserEntry {
    #[serde(default)]
    password: String,
    #[serde(default, with = "acl_map", skip_serializing_if = "Vec::is_empty")]
    acl: Vec<AclRule>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    disallow: bool,
}

/// ACL rules as a YAML mapping, keeping declaration order.
mod acl_map {
    use std::fmt;

    use serde::de::{MapAccess, Visitor};
    use serde::{Deserializer, Serializer};

    use crate::auth::ledger::{Access, AclRule};

    pub fn serialize<S: Serializer>(rules: &[AclRule], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(rules.iter().map(|rule| (&rule.filter, rule.access)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<AclRule>, D::Error> {
        struct RulesVisitor;

        impl<'de> Visitor<'de> for RulesVisitor {
            type Value = Vec<AclRule>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping of topic filter to access code")
            }

            fn visit_unit<E: serde::de::Error>(self) -> Result<Self::Value, E> {
                Ok(Vec::new())
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut rules = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((filter, access)) = map.next_entry::<String, Access>()? {
                    rules.push(AclRule { filter, access });
                }
                Ok(rules)
            }
        }

        deserializer.deserialize_any(RulesVisitor)
    }
}

/// Parse an auth document into a ledger.
///
/// Only users are representable in the file; connection rules and global
/// ACL rules start empty. Whitespace-only input yields an empty ledger.
pub fn parse(text: &str) -> Result<Ledger> {
    if text.trim().is_empty() {
        return Ok(Ledger::new());
    }

    let entries: BTreeMap<String, Option<UserEntry>> = serde_yaml::from_str(text)?;
    let mut ledger = Ledger::new();
    for (username, entry) in entries {
        let Some(entry) = entry else {
            ledger = ledger.with_user(User::new(username, ""));
            continue;
        };
        ledger = ledger.with_user(User {
            username,
            password: entry.password,
            acl: entry.acl,
            disallow: entry.disallow,
        });
    }
    ledger.validate()?;
    Ok(ledger)
}

/// Render the users of `ledger` as an auth document.
pub fn render(ledger: &Ledger) -> Result<String> {
    let entries: BTreeMap<&str, UserEntry> = ledger
        .users
        .values()
        .map(|user| {
            (
                user.username.as_str(),
                UserEntry {
                    password: user.password.clone(),
                    acl: user.acl.clone(),
                    disallow: user.disallow,
                },
            )
        })
        .collect();
    Ok(format!("{HEADER}{}", serde_yaml::to_string(&entries)?))
}

/// Write the built-in sample ledger to `path`.
pub fn write_sample(path: impl AsRef<Path>) -> Result<()> {
    fs::write(path, render(&Ledger::sample())?)?;
    Ok(())
}

/// Load the ledger for a broker, degrading instead of failing.
///
/// - no path: empty ledger
/// - unreadable file: warning, empty ledger
/// - malformed file: warning, sample ledger, and the sample is written back
pub fn load(path: Option<&Path>) -> Ledger {
    let Some(path) = path.filter(|p| !p.as_os_str().is_empty()) else {
        info!("no auth file configured, starting with an empty ledger");
        return Ledger::new();
    };

    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read auth file, starting with an empty ledger");
            return Ledger::new();
        }
    };

    match parse(&text) {
        Ok(ledger) => {
            info!(path = %path.display(), users = ledger.users.len(), "auth file loaded");
            ledger
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "malformed auth file, regenerating from sample");
            if let Err(e) = write_sample(path) {
                warn!(path = %path.display(), error = %e, "failed to rewrite auth file");
            }
            Ledger::sample()
        }
    }
}

impl Ledger {
    /// Read and parse an auth file, failing on any error.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        parse(&fs::read_to_string(path)?)
    }
}
