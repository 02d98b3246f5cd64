use cregion_types::config::{ServerConfig, StoreConfig};
use rand::Rng;
use std::time::Duration;
use xxhash_rust::xxh3::xxh3_64;

/// Static layout of the replicated store: which server holds which replica
/// of which shard.
///
/// Every shard is stored on `num_replicas` servers.  The server holding
/// replica `r` of shard `s` is `servers[s + num_shards * r]`.
#[derive(Debug)]
pub struct ReplicaPool {
    config: StoreConfig,
    hash_name: String,
}

impl ReplicaPool {
    pub fn new(config: StoreConfig) -> Self {
        let hash_name = format!("D{}", config.store_name);
        Self { config, hash_name }
    }

    /// Name of the hash that holds every key of this store.
    pub fn hash_name(&self) -> &str {
        &self.hash_name
    }

    pub fn num_shards(&self) -> usize {
        self.config.num_shards
    }

    pub fn num_replicas(&self) -> usize {
        self.config.num_replicas
    }

    /// Number of replicas that must acknowledge a command (and be reachable
    /// for a batch to start).
    pub fn majority(&self) -> usize {
        self.config.majority()
    }

    pub fn shard_of(&self, key: &str) -> usize {
        (xxh3_64(key.as_bytes()) % self.config.num_shards as u64) as usize
    }

    pub fn server_index(&self, shard: usize, replica: usize) -> usize {
        shard + self.config.num_shards * replica
    }

    /// Server indices of every replica of `shard`, in replica order.
    pub fn replicas_of(&self, shard: usize) -> impl Iterator<Item = usize> + '_ {
        (0..self.config.num_replicas).map(move |replica| self.server_index(shard, replica))
    }

    /// Order in which replicas of `shard` are asked for a read: a randomly
    /// chosen replica first, then the others in replica order.
    pub fn read_order(&self, shard: usize) -> Vec<usize> {
        let preferred = rand::thread_rng().gen_range(0..self.config.num_replicas);
        let mut order = Vec::with_capacity(self.config.num_replicas);
        order.push(self.server_index(shard, preferred));
        order.extend(
            (0..self.config.num_replicas)
                .filter(|replica| *replica != preferred)
                .map(|replica| self.server_index(shard, replica)),
        );
        order
    }

    pub fn server(&self, index: usize) -> &ServerConfig {
        &self.config.servers[index]
    }

    pub fn connect_timeout(&self) -> Duration {
        self.config.connect_timeout()
    }

    pub fn command_timeout(&self) -> Duration {
        self.config.command_timeout()
    }
}

#[cfg(test)]
mod test {
    use super::ReplicaPool;
    use cregion_types::config::{ServerConfig, StoreConfig};
    use std::collections::BTreeSet;

    fn pool(num_shards: usize, num_replicas: usize) -> ReplicaPool {
        let servers = (0..num_shards * num_replicas)
            .map(|i| ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 7000 + i as u16,
                password: None,
            })
            .collect();
        ReplicaPool::new(StoreConfig {
            store_name: "ckpt".to_string(),
            num_shards,
            num_replicas,
            servers,
            connect_timeout_ms: 100,
            command_timeout_ms: 100,
        })
    }

    #[test]
    fn layout() {
        let pool = pool(2, 3);
        assert_eq!(pool.hash_name(), "Dckpt");
        assert_eq!(pool.replicas_of(0).collect::<Vec<_>>(), vec![0, 2, 4]);
        assert_eq!(pool.replicas_of(1).collect::<Vec<_>>(), vec![1, 3, 5]);
        assert_eq!(pool.majority(), 2);
        assert!(pool.shard_of("some key") < 2);
        assert_eq!(pool.shard_of("some key"), pool.shard_of("some key"));
    }

    #[test]
    fn read_order_visits_every_replica_once() {
        let pool = pool(2, 5);
        let mut first = BTreeSet::new();
        for _ in 0..200 {
            let order = pool.read_order(1);
            assert_eq!(
                order.iter().copied().collect::<BTreeSet<_>>(),
                pool.replicas_of(1).collect::<BTreeSet<_>>()
            );
            first.insert(order[0]);
        }
        // The preferred replica is spread across the shard.
        assert!(first.len() > 1);
    }
}
