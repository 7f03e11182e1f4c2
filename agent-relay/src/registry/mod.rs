//! Presence registry and subscription table.
//!
//! One read-mostly lock guards both maps: delivery fanout takes shared
//! reads, while hello/disconnect/subscribe take the exclusive write path.
//! At most one session exists per agent name; a newer hello replaces the
//! older session.

// Layer 1: Standard library imports
use std::collections::{HashMap, HashSet};

// Layer 2: Third-party crate imports
use parking_lot::RwLock;

// Layer 3: Internal module imports
use crate::session::SessionHandle;
use crate::util::{AgentName, InvalidName, SessionId, TopicName};

/// A subscription pattern: an exact topic or the match-everything literal.
///
/// Patterns are matched by simple equality; `*` is the only wildcard and it
/// subscribes to every topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TopicPattern {
    /// Exactly one topic
    Exact(TopicName),
    /// Every topic (`*`)
    All,
}

impl TopicPattern {
    /// Parse the wire form: `*` or a topic name.
    pub fn parse(raw: &str) -> Result<Self, InvalidName> {
        if raw == "*" {
            Ok(Self::All)
        } else {
            TopicName::parse(raw).map(Self::Exact)
        }
    }
}

impl std::fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exact(topic) => write!(f, "{topic}"),
            Self::All => write!(f, "*"),
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    /// agent -> live session (direct mailbox map)
    agents: HashMap<AgentName, SessionHandle>,
    /// exact topic -> subscribed agents
    topics: HashMap<TopicName, HashSet<AgentName>>,
    /// agents subscribed to every topic via `*`
    all_topics: HashSet<AgentName>,
    /// reverse index for disconnect cleanup
    agent_patterns: HashMap<AgentName, HashSet<TopicPattern>>,
}

/// Shared presence and subscription state.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<RegistryInner>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session, returning the session it replaced (if any).
    ///
    /// The replaced session's subscriptions are dropped; the caller closes
    /// it with reason `replaced`.
    pub fn register(&self, session: SessionHandle) -> Option<SessionHandle> {
        let mut inner = self.inner.write();
        let agent = session.agent().clone();
        let replaced = inner.agents.insert(agent.clone(), session);
        if replaced.is_some() {
            Self::drop_subscriptions(&mut inner, &agent);
        }
        replaced
    }

    /// Remove a session if it is still the one registered under its name.
    ///
    /// The session-id check keeps a slow disconnect of a replaced session
    /// from tearing down its successor.
    pub fn unregister(&self, agent: &AgentName, session_id: SessionId) -> Option<SessionHandle> {
        let mut inner = self.inner.write();
        match inner.agents.get(agent) {
            Some(current) if current.id() == session_id => {
                let removed = inner.agents.remove(agent);
                Self::drop_subscriptions(&mut inner, agent);
                removed
            }
            _ => None,
        }
    }

    fn drop_subscriptions(inner: &mut RegistryInner, agent: &AgentName) {
        if let Some(patterns) = inner.agent_patterns.remove(agent) {
            for pattern in patterns {
                match pattern {
                    TopicPattern::Exact(topic) => {
                        if let Some(subscribers) = inner.topics.get_mut(&topic) {
                            subscribers.remove(agent);
                            if subscribers.is_empty() {
                                inner.topics.remove(&topic);
                            }
                        }
                    }
                    TopicPattern::All => {
                        inner.all_topics.remove(agent);
                    }
                }
            }
        }
    }

    /// Resolve the live session for an agent.
    pub fn resolve(&self, agent: &AgentName) -> Option<SessionHandle> {
        self.inner.read().agents.get(agent).cloned()
    }

    /// Whether an agent currently has a session.
    pub fn is_online(&self, agent: &AgentName) -> bool {
        self.inner.read().agents.contains_key(agent)
    }

    /// Subscribe a connected agent to a pattern. Returns false when the
    /// agent has no session (subscriptions are per-session state).
    pub fn subscribe(&self, agent: &AgentName, pattern: TopicPattern) -> bool {
        let mut inner = self.inner.write();
        if !inner.agents.contains_key(agent) {
            return false;
        }
        match &pattern {
            TopicPattern::Exact(topic) => {
                inner
                    .topics
                    .entry(topic.clone())
                    .or_default()
                    .insert(agent.clone());
            }
            TopicPattern::All => {
                inner.all_topics.insert(agent.clone());
            }
        }
        inner
            .agent_patterns
            .entry(agent.clone())
            .or_default()
            .insert(pattern);
        true
    }

    /// Remove one subscription. Returns whether it existed.
    pub fn unsubscribe(&self, agent: &AgentName, pattern: &TopicPattern) -> bool {
        let mut inner = self.inner.write();
        let existed = inner
            .agent_patterns
            .get_mut(agent)
            .is_some_and(|patterns| patterns.remove(pattern));
        if existed {
            match pattern {
                TopicPattern::Exact(topic) => {
                    if let Some(subscribers) = inner.topics.get_mut(topic) {
                        subscribers.remove(agent);
                        if subscribers.is_empty() {
                            inner.topics.remove(topic);
                        }
                    }
                }
                TopicPattern::All => {
                    inner.all_topics.remove(agent);
                }
            }
        }
        existed
    }

    /// Snapshot of broadcast receivers: every online non-observer agent
    /// except the sender. Computed once at accept time and frozen.
    pub fn broadcast_snapshot(&self, exclude: &AgentName) -> Vec<AgentName> {
        let inner = self.inner.read();
        let mut targets: Vec<AgentName> = inner
            .agents
            .keys()
            .filter(|name| *name != exclude && !name.is_observer())
            .cloned()
            .collect();
        targets.sort();
        targets
    }

    /// Snapshot of a topic's subscribers, including `*` subscribers.
    pub fn topic_snapshot(&self, topic: &TopicName) -> Vec<AgentName> {
        let inner = self.inner.read();
        let mut targets: HashSet<AgentName> = inner.all_topics.iter().cloned().collect();
        if let Some(subscribers) = inner.topics.get(topic) {
            targets.extend(subscribers.iter().cloned());
        }
        let mut targets: Vec<AgentName> = targets.into_iter().collect();
        targets.sort();
        targets
    }

    /// All live sessions (event broadcast fanout).
    pub fn sessions(&self) -> Vec<SessionHandle> {
        self.inner.read().agents.values().cloned().collect()
    }

    /// Number of connected agents.
    pub fn online_count(&self) -> usize {
        self.inner.read().agents.len()
    }

    /// Subscription table snapshot for admin queries.
    pub fn subscriptions(&self) -> Vec<(String, Vec<AgentName>)> {
        let inner = self.inner.read();
        let mut table: Vec<(String, Vec<AgentName>)> = inner
            .topics
            .iter()
            .map(|(topic, subscribers)| {
                let mut agents: Vec<AgentName> = subscribers.iter().cloned().collect();
                agents.sort();
                (topic.to_string(), agents)
            })
            .collect();
        if !inner.all_topics.is_empty() {
            let mut agents: Vec<AgentName> = inner.all_topics.iter().cloned().collect();
            agents.sort();
            table.push(("*".to_string(), agents));
        }
        table.sort_by(|a, b| a.0.cmp(&b.0));
        table
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::session::Session;

    fn agent(name: &str) -> AgentName {
        AgentName::parse(name).unwrap()
    }

    fn topic(name: &str) -> TopicName {
        TopicName::parse(name).unwrap()
    }

    fn connect(registry: &Registry, name: &str) -> SessionHandle {
        let (session, rx) = Session::new(agent(name), 8);
        // Keep the receiver alive for the duration of the test.
        std::mem::forget(rx);
        registry.register(session.clone());
        session
    }

    #[test]
    fn test_register_and_resolve() {
        let registry = Registry::new();
        let session = connect(&registry, "Alice");
        assert_eq!(registry.resolve(&agent("Alice")).unwrap().id(), session.id());
        assert!(registry.resolve(&agent("Bob")).is_none());
    }

    #[test]
    fn test_register_replaces_same_name() {
        let registry = Registry::new();
        let old = connect(&registry, "Alice");
        let (new, rx) = Session::new(agent("Alice"), 8);
        std::mem::forget(rx);

        let replaced = registry.register(new.clone()).unwrap();
        assert_eq!(replaced.id(), old.id());
        assert_eq!(registry.online_count(), 1);
        assert_eq!(registry.resolve(&agent("Alice")).unwrap().id(), new.id());
    }

    #[test]
    fn test_unregister_checks_session_id() {
        let registry = Registry::new();
        let old = connect(&registry, "Alice");
        let new = connect(&registry, "Alice");

        // The replaced session's late disconnect must not evict its successor.
        assert!(registry.unregister(&agent("Alice"), old.id()).is_none());
        assert!(registry.is_online(&agent("Alice")));

        assert!(registry.unregister(&agent("Alice"), new.id()).is_some());
        assert!(!registry.is_online(&agent("Alice")));
    }

    #[test]
    fn test_broadcast_excludes_sender_and_observers() {
        let registry = Registry::new();
        connect(&registry, "Alice");
        connect(&registry, "Bob");
        connect(&registry, "Carol");
        connect(&registry, "__observer__");

        let targets = registry.broadcast_snapshot(&agent("Alice"));
        assert_eq!(targets, vec![agent("Bob"), agent("Carol")]);
    }

    #[test]
    fn test_topic_subscription_fanout() {
        let registry = Registry::new();
        connect(&registry, "Alice");
        connect(&registry, "Bob");

        assert!(registry.subscribe(&agent("Bob"), TopicPattern::Exact(topic("deploys"))));
        assert_eq!(
            registry.topic_snapshot(&topic("deploys")),
            vec![agent("Bob")]
        );
        assert!(registry.topic_snapshot(&topic("other")).is_empty());
    }

    #[test]
    fn test_star_pattern_matches_every_topic() {
        let registry = Registry::new();
        connect(&registry, "__observer__");
        assert!(registry.subscribe(&agent("__observer__"), TopicPattern::All));

        assert_eq!(
            registry.topic_snapshot(&topic("anything")),
            vec![agent("__observer__")]
        );
    }

    #[test]
    fn test_subscribe_requires_session() {
        let registry = Registry::new();
        assert!(!registry.subscribe(&agent("Ghost"), TopicPattern::All));
    }

    #[test]
    fn test_unsubscribe() {
        let registry = Registry::new();
        connect(&registry, "Bob");
        let pattern = TopicPattern::Exact(topic("deploys"));
        registry.subscribe(&agent("Bob"), pattern.clone());

        assert!(registry.unsubscribe(&agent("Bob"), &pattern));
        assert!(!registry.unsubscribe(&agent("Bob"), &pattern));
        assert!(registry.topic_snapshot(&topic("deploys")).is_empty());
    }

    #[test]
    fn test_disconnect_drops_subscriptions() {
        let registry = Registry::new();
        let session = connect(&registry, "Bob");
        registry.subscribe(&agent("Bob"), TopicPattern::Exact(topic("deploys")));
        registry.subscribe(&agent("Bob"), TopicPattern::All);

        registry.unregister(&agent("Bob"), session.id());
        assert!(registry.topic_snapshot(&topic("deploys")).is_empty());
        assert!(registry.subscriptions().is_empty());
    }

    #[test]
    fn test_replacement_starts_with_fresh_subscriptions() {
        let registry = Registry::new();
        connect(&registry, "Bob");
        registry.subscribe(&agent("Bob"), TopicPattern::Exact(topic("deploys")));

        // New hello under the same name: old session's subscriptions go away.
        connect(&registry, "Bob");
        assert!(registry.topic_snapshot(&topic("deploys")).is_empty());
    }

    #[test]
    fn test_subscriptions_table() {
        let registry = Registry::new();
        connect(&registry, "Alice");
        connect(&registry, "Bob");
        registry.subscribe(&agent("Alice"), TopicPattern::Exact(topic("deploys")));
        registry.subscribe(&agent("Bob"), TopicPattern::Exact(topic("deploys")));
        registry.subscribe(&agent("Bob"), TopicPattern::All);

        let table = registry.subscriptions();
        assert_eq!(table.len(), 2);
        assert_eq!(table[0].0, "*");
        assert_eq!(table[1].0, "deploys");
        assert_eq!(table[1].1.len(), 2);
    }

    #[test]
    fn test_topic_pattern_parse() {
        assert_eq!(TopicPattern::parse("*").unwrap(), TopicPattern::All);
        assert!(matches!(
            TopicPattern::parse("deploys").unwrap(),
            TopicPattern::Exact(_)
        ));
        assert!(TopicPattern::parse("bad topic").is_err());
    }
}
