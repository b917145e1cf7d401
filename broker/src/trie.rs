// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Subscription store.
//!
//! A trie keyed by topic-filter levels, with the nodes held in a flat arena
//! and child links expressed as `u32` indices. The arena avoids pointer
//! cycles and keeps the disconnect sweep a plain linear scan. Wildcard
//! levels (`+`, `#`) are ordinary child keys; matching interprets them.

use std::collections::HashMap;

use codec::SubTopic;

use crate::types::ClientId;

/// One subscription entry on a trie node.
///
/// `no_local` is carried here so that fan-out can skip deliveries back to
/// the publisher without re-matching the publisher's filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    pub client_id: ClientId,
    pub no_local: bool,
}

#[derive(Debug, Default, Clone)]
struct TrieNode {
    subscribers: Vec<Subscriber>,
    children: HashMap<String, u32>,
}

/// Arena-backed subscription trie. The root is always index 0.
#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Clone)]
pub struct TopicIndex {
    nodes: Vec<TrieNode>,
}

impl Default for TopicIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl TopicIndex {
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: vec![TrieNode::default()],
        }
    }

    /// Number of arena nodes, root included.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Install a subscription for `client_id` under `filter`.
    ///
    /// Subscribing twice to the same filter is idempotent: the client id
    /// appears at most once per node, the second call only refreshes the
    /// `no_local` option.
    pub fn subscribe(&mut self, filter: &SubTopic, client_id: &str, no_local: bool) {
        let mut current = 0usize;
        for level in filter.levels() {
            let existing = self.nodes[current].children.get(level).copied();
            current = match existing {
                Some(child) => child as usize,
                None => {
                    let child = self.nodes.len();
                    self.nodes.push(TrieNode::default());
                    #[allow(clippy::cast_possible_truncation)]
                    self.nodes[current]
                        .children
                        .insert(level.to_string(), child as u32);
                    child
                }
            };
        }

        let subscribers = &mut self.nodes[current].subscribers;
        if let Some(existing) = subscribers.iter_mut().find(|s| s.client_id == client_id) {
            existing.no_local = no_local;
        } else {
            subscribers.push(Subscriber {
                client_id: client_id.to_string(),
                no_local,
            });
        }
    }

    /// Remove the subscription of `client_id` under `filter`.
    ///
    /// Returns false if no such subscription existed. Emptied nodes stay in
    /// the arena; they are rare and keep child indices stable.
    pub fn unsubscribe(&mut self, filter: &SubTopic, client_id: &str) -> bool {
        let mut current = 0usize;
        for level in filter.levels() {
            match self.nodes[current].children.get(level) {
                Some(&child) => current = child as usize,
                None => return false,
            }
        }

        let subscribers = &mut self.nodes[current].subscribers;
        let old_len = subscribers.len();
        subscribers.retain(|s| s.client_id != client_id);
        subscribers.len() != old_len
    }

    /// Drop every subscription of `client_id`.
    ///
    /// Linear scan of the whole arena. Disconnects are rare relative to
    /// publishes, so the sweep beats maintaining an inverted index.
    pub fn remove_client(&mut self, client_id: &str) {
        for node in &mut self.nodes {
            node.subscribers.retain(|s| s.client_id != client_id);
        }
    }

    /// Collect the subscribers whose filter matches `topic`.
    ///
    /// Breadth-over-levels walk with a worklist of node indices. At each
    /// level every worklist node contributes its `#` child's subscribers
    /// (`#` matches the current level and everything below), forks into its
    /// `+` child, and advances into its literal child when one exists. The
    /// nodes left after the last level are the exact matches.
    ///
    /// A client subscribed through several matching filters is reported once
    /// per filter; callers that need distinct clients dedupe themselves.
    #[must_use]
    pub fn match_topic(&self, topic: &str) -> Vec<Subscriber> {
        let mut matched = Vec::new();
        let mut worklist: Vec<u32> = vec![0];

        for level in topic.split('/') {
            let mut next = Vec::with_capacity(worklist.len());
            for &index in &worklist {
                let node = &self.nodes[index as usize];
                if let Some(&hash_child) = node.children.get("#") {
                    matched
                        .extend_from_slice(&self.nodes[hash_child as usize].subscribers);
                }
                if let Some(&plus_child) = node.children.get("+") {
                    next.push(plus_child);
                }
                if let Some(&literal_child) = node.children.get(level) {
                    next.push(literal_child);
                }
            }
            worklist = next;
            if worklist.is_empty() {
                break;
            }
        }

        for &index in &worklist {
            matched.extend_from_slice(&self.nodes[index as usize].subscribers);
        }

        matched
    }
}
