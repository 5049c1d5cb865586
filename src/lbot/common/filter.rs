use fnv::FnvHashSet;
use std::hash::{Hash, Hasher};

/// A filter over topic name hashes, used to decide whether a plugin should
/// observe a given topic. Mirrors `labrat::lbot::Filter`: a blacklist rejects
/// the hashes in its set, a whitelist accepts only them. Switching modes
/// clears the set. The default is an empty blacklist, i.e. accept-all.
#[derive(Default)]
pub struct Filter {
    set: FnvHashSet<u64>,
    mode: Mode,
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum Mode {
    Blacklist,
    Whitelist,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Blacklist
    }
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// `check(h) = contains(h) XOR mode`, exactly as specified.
    pub fn check(&self, topic_hash: u64) -> bool {
        self.set.contains(&topic_hash) ^ (self.mode == Mode::Blacklist)
    }

    pub fn check_name(&self, topic_name: &str) -> bool {
        self.check(hash_topic_name(topic_name))
    }

    /// Whitelist a topic. All previously blacklisted topics are removed.
    pub fn whitelist(&mut self, topic_name: &str) {
        self.add(Mode::Whitelist, hash_topic_name(topic_name));
    }

    /// Blacklist a topic. All previously whitelisted topics are removed.
    pub fn blacklist(&mut self, topic_name: &str) {
        self.add(Mode::Blacklist, hash_topic_name(topic_name));
    }

    fn add(&mut self, mode: Mode, topic_hash: u64) {
        if self.mode != mode {
            self.set.clear();
            self.mode = mode;
        }
        self.set.insert(topic_hash);
    }
}

/// Hash a topic name the same way everywhere a hash is needed: for the
/// filter set above and for the hash carried in `TopicInfo`.
pub fn hash_topic_name(topic_name: &str) -> u64 {
    let mut hasher = fnv::FnvHasher::default();
    topic_name.hash(&mut hasher);
    hasher.finish()
}
