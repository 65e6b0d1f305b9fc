//! Unit tests for manager configuration

#[cfg(test)]
mod tests {
    use crate::chain::Network;
    use crate::client::config::ManagerConfig;
    use std::time::Duration;

    #[test]
    fn test_default_config() {
        let config = ManagerConfig::default();

        assert_eq!(config.network_params.network, Network::Mainnet);
        assert_eq!(config.max_connections, 3);
        assert_eq!(config.max_known_peers, 2500);
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.sync_timeout, Duration::from_secs(20));
        assert_eq!(config.publish_timeout, Duration::from_secs(20));
        assert_eq!(config.min_relay_peers, 2);
        assert_eq!(config.max_reorg_depth, 100);
        assert_eq!(config.headers_batch_size, 2000);
        assert_eq!(config.blocks_batch_size, 500);
        assert_eq!(config.max_future_block_time, Duration::from_secs(7200));
        assert_eq!(config.bloom_fp_rate, 0.0005);
        assert_eq!(config.bloom_reduced_fp_rate, 0.00005);
        assert_eq!(config.ban_score, 100);
        assert_eq!(config.misbehavior.checkpoint_mismatch, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_network_specific_configs() {
        assert_eq!(ManagerConfig::testnet().network_params.network, Network::Testnet);
        let regtest = ManagerConfig::regtest();
        assert_eq!(regtest.network_params.network, Network::Regtest);
        assert!(regtest.network_params.checkpoints.is_empty());
    }

    #[test]
    fn test_builder_pattern() {
        let config = ManagerConfig::regtest()
            .with_max_connections(5)
            .with_sync_timeout(Duration::from_secs(5))
            .with_publish_timeout(Duration::from_secs(7))
            .with_min_relay_peers(3)
            .with_max_reorg_depth(10)
            .with_block_retention(50)
            .with_bloom_rates(0.001, 0.0001)
            .with_ban_score(50);

        assert_eq!(config.max_connections, 5);
        assert_eq!(config.sync_timeout, Duration::from_secs(5));
        assert_eq!(config.publish_timeout, Duration::from_secs(7));
        assert_eq!(config.min_relay_peers, 3);
        assert_eq!(config.chain_limits().max_reorg_depth, 10);
        assert_eq!(config.chain_limits().block_retention, 50);
        assert_eq!(config.bloom_config().false_positive_rate, 0.001);
        assert_eq!(config.ban_score, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_failures() {
        assert!(ManagerConfig::default().with_max_connections(0).validate().is_err());
        assert!(ManagerConfig::default().with_min_relay_peers(0).validate().is_err());
        assert!(ManagerConfig::default()
            .with_connect_timeout(Duration::from_secs(60))
            .validate()
            .is_err());
        assert!(ManagerConfig::default().with_block_retention(10).validate().is_err());
        assert!(ManagerConfig::default().with_bloom_rates(0.0, 0.1).validate().is_err());
        assert!(ManagerConfig::default().with_bloom_rates(0.1, 1.0).validate().is_err());
        assert!(ManagerConfig::default().with_ban_score(0).validate().is_err());

        let mut config = ManagerConfig::default();
        config.bloom_pad_min = 300;
        assert!(config.validate().is_err());
    }
}
