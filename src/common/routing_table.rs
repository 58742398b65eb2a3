//! Simplified Kademlia routing table

use std::collections::BTreeMap;
use std::net::SocketAddrV4;
use std::slice::Iter;
use std::time::{Duration, Instant};

use crate::common::{Id, Node};

/// K = the default maximum size of a k-bucket.
pub const DEFAULT_BUCKET_SIZE_K: usize = 8;

#[derive(Debug, Clone)]
/// Simplified Kademlia routing table
///
/// Buckets are indexed by their distance from the local [Id], which is equivalent
/// to a table where the bucket covering the local id was split all the way down.
pub struct RoutingTable {
    id: Id,
    k: usize,
    buckets: BTreeMap<u8, KBucket>,
}

impl RoutingTable {
    /// Create a new [RoutingTable] with a given id and [DEFAULT_BUCKET_SIZE_K].
    pub fn new(id: Id) -> Self {
        Self::with_bucket_size(id, DEFAULT_BUCKET_SIZE_K)
    }

    /// Create a new [RoutingTable] with a given id and bucket size `k`.
    pub fn with_bucket_size(id: Id, k: usize) -> Self {
        RoutingTable {
            id,
            k: k.max(1),
            buckets: BTreeMap::new(),
        }
    }

    /// Returns the [Id] of this node, where the distance is measured from.
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Returns the maximum size of each bucket.
    pub fn k(&self) -> usize {
        self.k
    }

    // === Public Methods ===

    /// Insert a new node, or refresh an existing one, and return `true` if the table changed.
    ///
    /// Refreshing moves the node to the most recently seen end of its bucket,
    /// updates its address and clears its failures.
    pub fn add(&mut self, node: Node) -> bool {
        let distance = self.id.distance(node.id());

        if distance == 0 {
            // Do not add self to the routing_table
            return false;
        }

        if self
            .nodes()
            .any(|existing| existing.same_address(&node) && existing.id() != node.id())
        {
            return false;
        }

        let k = self.k;
        let bucket = self
            .buckets
            .entry(distance)
            .or_insert_with(|| KBucket::new(k));

        bucket.add(node)
    }

    /// Remove a node from this routing table.
    pub fn remove(&mut self, node_id: &Id) {
        let distance = self.id.distance(node_id);

        if let Some(bucket) = self.buckets.get_mut(&distance) {
            bucket.remove(node_id)
        }
    }

    /// Count a failed request against the node at this address.
    ///
    /// Returns `true` if such a node exists.
    pub fn mark_unresponsive(&mut self, address: SocketAddrV4) -> bool {
        for bucket in self.buckets.values_mut() {
            if let Some(node) = bucket.nodes.iter_mut().find(|n| n.address == address) {
                node.failed_requests = node.failed_requests.saturating_add(1);
                return true;
            }
        }

        false
    }

    /// Remove all nodes that failed too many consecutive requests,
    /// and return their ids.
    pub fn remove_stale(&mut self) -> Vec<Id> {
        let mut removed = vec![];

        for bucket in self.buckets.values_mut() {
            bucket.nodes.retain(|node| {
                if node.is_stale() {
                    removed.push(node.id);
                    false
                } else {
                    true
                }
            });
        }

        self.buckets.retain(|_, bucket| !bucket.is_empty());

        removed
    }

    /// Return at most `count` nodes sorted by their XOR distance to the `target`.
    pub fn find_closest(&self, target: &Id, count: usize) -> Vec<Node> {
        let mut nodes: Vec<&Node> = self.nodes().collect();

        // Distinct ids never share a distance to the same target.
        nodes.sort_by_key(|node| node.id().xor(target));

        nodes.into_iter().take(count).cloned().collect()
    }

    /// Return the `k` closest nodes to the target.
    pub fn closest(&self, target: &Id) -> Box<[Node]> {
        self.find_closest(target, self.k).into()
    }

    /// Returns a random [Id] within the range of every bucket that didn't change
    /// for `interval`, and marks these buckets as refreshed.
    pub fn buckets_to_refresh(&mut self, now: Instant, interval: Duration) -> Vec<Id> {
        let mut ids = vec![];

        for (distance, bucket) in self.buckets.iter_mut() {
            if now.saturating_duration_since(bucket.last_changed) >= interval {
                bucket.last_changed = now;
                ids.push(self.id.random_at_distance(*distance));
            }
        }

        ids
    }

    /// Returns `true` if this routing table is empty.
    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(|bucket| bucket.is_empty())
    }

    /// Return the number of nodes in this routing table.
    pub fn size(&self) -> usize {
        self.buckets
            .values()
            .fold(0, |acc, bucket| acc + bucket.nodes.len())
    }

    /// Returns an iterator over the nodes in this routing table, closest buckets first.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.buckets.values().flat_map(|bucket| bucket.iter())
    }

    /// Turn this routing table to a list of bootstrapping nodes.
    pub fn to_bootstrap(&self) -> Vec<String> {
        self.nodes()
            .filter(|n| n.is_good())
            .map(|n| n.address().to_string())
            .collect()
    }

    /// Returns the node with this id, if any.
    pub fn get(&self, node_id: &Id) -> Option<&Node> {
        let distance = self.id.distance(node_id);

        self.buckets
            .get(&distance)
            .and_then(|bucket| bucket.iter().find(|node| node.id() == node_id))
    }

    // === Private Methods ===

    #[cfg(test)]
    fn contains(&self, node_id: &Id) -> bool {
        self.get(node_id).is_some()
    }
}

/// Kbuckets are similar to LRU caches that checks and evicts unresponsive nodes,
/// without dropping any responsive nodes in the process.
#[derive(Debug, Clone)]
pub struct KBucket {
    k: usize,
    /// Nodes in the k-bucket, sorted by the least recently seen.
    nodes: Vec<Node>,
    last_changed: Instant,
}

impl KBucket {
    pub fn new(k: usize) -> Self {
        KBucket {
            k,
            nodes: Vec::with_capacity(k),
            last_changed: Instant::now(),
        }
    }

    // === Public Methods ===

    pub fn add(&mut self, mut incoming: Node) -> bool {
        if let Some(index) = self.iter().position(|n| n.id() == incoming.id()) {
            let existing = self.nodes.remove(index);

            if incoming.token.is_none() {
                incoming.token = existing.token;
            }
            incoming.failed_requests = 0;
            incoming.last_seen = Instant::now();

            self.nodes.push(incoming);
        } else if self.nodes.len() < self.k {
            self.nodes.push(incoming);
        } else {
            // Most consecutive failures, least recently seen on ties.
            let mut worst = 0;
            for (index, node) in self.nodes.iter().enumerate() {
                if node.failed_requests > self.nodes[worst].failed_requests {
                    worst = index;
                }
            }

            if self.nodes[worst].is_good() {
                return false;
            }

            self.nodes.remove(worst);
            self.nodes.push(incoming);
        }

        self.last_changed = Instant::now();

        true
    }

    pub fn remove(&mut self, node_id: &Id) {
        self.nodes.retain(|node| node.id() != node_id);
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> Iter<'_, Node> {
        self.nodes.iter()
    }
}

#[cfg(test)]
mod test {
    use std::net::SocketAddrV4;
    use std::time::{Duration, Instant};

    use crate::common::{Id, KBucket, Node, RoutingTable, DEFAULT_BUCKET_SIZE_K};

    #[test]
    fn table_is_empty() {
        let mut table = RoutingTable::new(Id::random());
        assert!(table.is_empty());

        table.add(Node::random());
        assert!(!table.is_empty());
    }

    #[test]
    fn to_vec() {
        let mut table = RoutingTable::new(Id::random());

        let mut expected_nodes: Vec<Node> = vec![];

        for i in 0..DEFAULT_BUCKET_SIZE_K {
            expected_nodes.push(Node::unique(i));
        }

        for node in &expected_nodes {
            table.add(node.clone());
        }

        let mut sorted_table = table.nodes().cloned().collect::<Vec<_>>();
        sorted_table.sort_by(|a, b| a.id().cmp(b.id()));

        let mut sorted_expected = expected_nodes.to_vec();
        sorted_expected.sort_by(|a, b| a.id().cmp(b.id()));

        assert_eq!(sorted_table, sorted_expected);
    }

    #[test]
    fn contains() {
        let mut table = RoutingTable::new(Id::random());

        let node = Node::random();

        assert!(!table.contains(node.id()));

        table.add(node.clone());
        assert!(table.contains(node.id()));
    }

    #[test]
    fn remove() {
        let mut table = RoutingTable::new(Id::random());

        let node = Node::random();

        table.add(node.clone());
        assert!(table.contains(node.id()));

        table.remove(node.id());
        assert!(!table.contains(node.id()));
    }

    #[test]
    fn buckets_are_sets() {
        let mut table = RoutingTable::new(Id::random());

        let node1 = Node::random();
        let node2 = Node::new(*node1.id(), node1.address());

        table.add(node1);
        table.add(node2);

        assert_eq!(table.size(), 1);
    }

    #[test]
    fn should_not_add_self() {
        let mut table = RoutingTable::new(Id::random());
        let node = Node::new(*table.id(), SocketAddrV4::new(0.into(), 0));

        assert!(!table.add(node));
        assert!(table.is_empty())
    }

    #[test]
    fn should_not_add_address_claimed_by_other_id() {
        let mut table = RoutingTable::new(Id::random());

        let node = Node::random();
        let impostor = Node::new(Id::random(), node.address());

        assert!(table.add(node.clone()));
        assert!(!table.add(impostor.clone()));

        assert!(table.contains(node.id()));
        assert!(!table.contains(impostor.id()));
    }

    #[test]
    fn should_not_add_more_than_k() {
        let mut bucket = KBucket::new(DEFAULT_BUCKET_SIZE_K);

        for i in 0..DEFAULT_BUCKET_SIZE_K {
            let node = Node::random();
            assert!(bucket.add(node), "Failed to add node {i}");
        }

        let node = Node::random();

        assert!(!bucket.add(node));
        assert_eq!(bucket.nodes.len(), DEFAULT_BUCKET_SIZE_K);
    }

    #[test]
    fn full_bucket_evicts_most_failing_node() {
        let mut bucket = KBucket::new(4);

        for i in 0..4 {
            bucket.add(Node::unique(i));
        }

        bucket.nodes[1].failed_requests = 1;
        bucket.nodes[2].failed_requests = 2;
        bucket.nodes[3].failed_requests = 2;

        let evicted = *bucket.nodes[2].id();
        let newcomer = Node::unique(10);

        assert!(bucket.add(newcomer.clone()));

        assert_eq!(bucket.nodes.len(), 4);
        assert!(!bucket.iter().any(|n| n.id() == &evicted));
        assert_eq!(bucket.nodes[3].id(), newcomer.id());
    }

    #[test]
    fn should_update_existing_node() {
        // Same address
        {
            let mut bucket = KBucket::new(DEFAULT_BUCKET_SIZE_K);

            let node1 = Node::random();
            let node2 = Node::new(*node1.id(), node1.address());

            bucket.add(node1.clone());
            bucket.add(Node::random());

            assert_ne!(bucket.nodes[1].id(), node1.id());

            bucket.add(node2);

            assert_eq!(bucket.nodes.len(), 2);
            assert_eq!(bucket.nodes[1].id(), node1.id());
        }

        // Different address
        {
            let mut bucket = KBucket::new(DEFAULT_BUCKET_SIZE_K);

            let node1 = Node::random();
            let node2 = Node::new(*node1.id(), SocketAddrV4::new([0, 0, 0, 1].into(), 1));

            bucket.add(node1.clone());
            bucket.add(Node::random());

            bucket.nodes[0].failed_requests = 1;

            bucket.add(node2.clone());

            assert_eq!(bucket.nodes.len(), 2);
            assert_eq!(bucket.nodes[1].id(), node1.id());
            assert_eq!(bucket.nodes[1].address(), node2.address());
            assert_eq!(bucket.nodes[1].failed_requests(), 0);
        }
    }

    #[test]
    fn mark_unresponsive_and_remove_stale() {
        let mut table = RoutingTable::new(Id::random());

        let node = Node::random();
        let other = Node::random();
        table.add(node.clone());
        table.add(other.clone());

        assert!(table.mark_unresponsive(node.address()));
        assert!(table.remove_stale().is_empty());

        assert!(table.mark_unresponsive(node.address()));
        assert_eq!(table.remove_stale(), vec![*node.id()]);

        assert!(!table.contains(node.id()));
        assert!(table.contains(other.id()));

        assert!(!table.mark_unresponsive(node.address()));
    }

    #[test]
    fn find_closest_is_sorted_and_bounded() {
        let mut table = RoutingTable::with_bucket_size(Id::random(), 20);

        for i in 0..200 {
            table.add(Node::unique(i));
        }

        let target = Id::random();

        for count in [0, 1, 5, 20, 1000] {
            let closest = table.find_closest(&target, count);

            assert!(closest.len() <= count);
            assert_eq!(closest.len(), count.min(table.size()));

            let distances = closest
                .iter()
                .map(|n| n.id().xor(&target))
                .collect::<Vec<_>>();

            let mut sorted = distances.clone();
            sorted.sort();

            assert_eq!(sorted, distances);
        }
    }

    #[test]
    fn buckets_to_refresh() {
        let local = Id::random();
        let mut table = RoutingTable::new(local);

        let node = Node::new(local.random_at_distance(150), "1.1.1.1:1".parse().unwrap());
        table.add(node);

        let now = Instant::now();

        assert!(table
            .buckets_to_refresh(now, Duration::from_secs(60))
            .is_empty());

        let later = now + Duration::from_secs(61);
        let ids = table.buckets_to_refresh(later, Duration::from_secs(60));

        assert_eq!(ids.len(), 1);
        assert_eq!(local.distance(&ids[0]), 150);

        // Marked as refreshed.
        assert!(table
            .buckets_to_refresh(later, Duration::from_secs(60))
            .is_empty());
    }

    #[test]
    fn closest() {
        for _ in 0..10 {
            let mut table = RoutingTable::new(Id::random());

            for i in 0..500 {
                table.add(Node::unique(i));
            }

            let target = Id::random();

            let mut expected: Vec<Id> = table.nodes().map(|n| *n.id()).collect();
            expected.sort_by_key(|id| id.xor(&target));
            expected.truncate(DEFAULT_BUCKET_SIZE_K);

            let closest: Vec<Id> = table.closest(&target).iter().map(|n| *n.id()).collect();

            assert_eq!(closest, expected);
        }
    }

    #[test]
    fn closest_of_every_added_node() {
        let mut table = RoutingTable::with_bucket_size(Id::random(), 1000);

        let nodes: Vec<Node> = (0..300).map(Node::unique).collect();
        for node in &nodes {
            table.add(node.clone());
        }
        assert_eq!(table.size(), nodes.len());

        let target = Id::random();

        let mut expected: Vec<Id> = nodes.iter().map(|n| *n.id()).collect();
        expected.sort_by_key(|id| id.xor(&target));
        expected.truncate(DEFAULT_BUCKET_SIZE_K);

        let closest: Vec<Id> = table
            .find_closest(&target, DEFAULT_BUCKET_SIZE_K)
            .iter()
            .map(|n| *n.id())
            .collect();

        assert_eq!(closest, expected);
    }
}
