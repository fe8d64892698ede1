use std::fmt;

/// A logical pub/sub destination. Every channel is scoped to one
/// application, so that application's broker artifacts can be purged
/// without touching others.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    /// Agents → DM.
    Dm { application: String },
    /// DM → the agent owning `root_instance`.
    Agent {
        application: String,
        root_instance: String,
    },
    /// Export announcements for consumers of `prefix`.
    Imports { application: String, prefix: String },
    /// Re-publication requests addressed to exporters of `prefix`.
    Exports { application: String, prefix: String },
}

impl Channel {
    pub fn dm(application: &str) -> Self {
        Channel::Dm {
            application: application.to_owned(),
        }
    }

    pub fn agent(application: &str, root_instance: &str) -> Self {
        Channel::Agent {
            application: application.to_owned(),
            root_instance: root_instance.to_owned(),
        }
    }

    pub fn imports(application: &str, prefix: &str) -> Self {
        Channel::Imports {
            application: application.to_owned(),
            prefix: prefix.to_owned(),
        }
    }

    pub fn exports(application: &str, prefix: &str) -> Self {
        Channel::Exports {
            application: application.to_owned(),
            prefix: prefix.to_owned(),
        }
    }

    pub fn application(&self) -> &str {
        match self {
            Channel::Dm { application }
            | Channel::Agent { application, .. }
            | Channel::Imports { application, .. }
            | Channel::Exports { application, .. } => application,
        }
    }

    /// Broker topic name, e.g. `shop/imports/db`.
    pub fn topic(&self) -> String {
        match self {
            Channel::Dm { application } => format!("{application}/dm"),
            Channel::Agent {
                application,
                root_instance,
            } => format!("{application}/agent/{root_instance}"),
            Channel::Imports {
                application,
                prefix,
            } => format!("{application}/imports/{prefix}"),
            Channel::Exports {
                application,
                prefix,
            } => format!("{application}/exports/{prefix}"),
        }
    }

    pub fn parse(topic: &str) -> Option<Self> {
        let mut parts = topic.splitn(3, '/');
        let application = parts.next().filter(|s| !s.is_empty())?;
        let kind = parts.next()?;
        let rest = parts.next();
        match (kind, rest) {
            ("dm", None) => Some(Channel::dm(application)),
            ("agent", Some(root)) if !root.is_empty() => Some(Channel::agent(application, root)),
            ("imports", Some(prefix)) if !prefix.is_empty() => {
                Some(Channel::imports(application, prefix))
            }
            ("exports", Some(prefix)) if !prefix.is_empty() => {
                Some(Channel::exports(application, prefix))
            }
            _ => None,
        }
    }
}

/// Topic prefix shared by every channel of `application`.
pub fn application_topic_prefix(application: &str) -> String {
    format!("{application}/")
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.topic())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_are_application_scoped() {
        let channels = [
            Channel::dm("shop"),
            Channel::agent("shop", "vm1"),
            Channel::imports("shop", "db"),
            Channel::exports("shop", "db"),
        ];
        for c in &channels {
            assert!(c.topic().starts_with(&application_topic_prefix("shop")));
            assert_eq!(c.application(), "shop");
            assert_eq!(Channel::parse(&c.topic()).as_ref(), Some(c));
        }
    }

    #[test]
    fn imports_and_exports_differ() {
        assert_ne!(
            Channel::imports("a", "db").topic(),
            Channel::exports("a", "db").topic()
        );
    }

    #[test]
    fn parse_rejects_malformed() {
        assert_eq!(Channel::parse(""), None);
        assert_eq!(Channel::parse("shop"), None);
        assert_eq!(Channel::parse("shop/agent"), None);
        assert_eq!(Channel::parse("shop/dm/extra"), None);
        assert_eq!(Channel::parse("shop/weird/x"), None);
    }
}
