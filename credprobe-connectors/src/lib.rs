//! One connector per supported service family. Each adapter speaks just
//! enough of its protocol to verify access, gather bounded evidence, and
//! (where meaningful) execute a command.

mod context;
mod credentials;
mod io;
mod traits;

mod adb;
mod docker;
mod elasticsearch;
mod etcd;
mod ftp;
mod jdwp;
mod kafka;
mod kubernetes;
mod memcached;
mod mongodb;
mod mqtt;
mod mysql;
mod ntlm;
mod oracle;
mod postgres;
mod rabbitmq;
mod rdp;
mod redis;
mod rmi;
mod smb;
mod sqlserver;
mod ssh;
mod vnc;
mod wmi;
mod zookeeper;

pub use context::ProbeContext;
pub use credentials::{candidates, prober};
pub use traits::{Connector, ProbeReport};

pub use adb::AdbConnector;
pub use docker::DockerConnector;
pub use elasticsearch::ElasticsearchConnector;
pub use etcd::EtcdConnector;
pub use ftp::FtpConnector;
pub use jdwp::JdwpConnector;
pub use kafka::KafkaConnector;
pub use kubernetes::KubernetesConnector;
pub use memcached::MemcachedConnector;
pub use mongodb::MongoDbConnector;
pub use mqtt::MqttConnector;
pub use mysql::MySqlConnector;
pub use oracle::OracleConnector;
pub use postgres::PostgresConnector;
pub use rabbitmq::RabbitMqConnector;
pub use rdp::RdpConnector;
pub use redis::RedisConnector;
pub use rmi::RmiConnector;
pub use smb::SmbConnector;
pub use sqlserver::SqlServerConnector;
pub use ssh::{SftpConnector, SshConnector};
pub use vnc::VncConnector;
pub use wmi::WmiConnector;
pub use zookeeper::ZookeeperConnector;

use credprobe_types::Protocol;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("operation timed out")]
    Timeout,
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("authentication scheme not supported: {0}")]
    UnsupportedAuth(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("{0} does not support commands")]
    Unsupported(Protocol),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Net(#[from] credprobe_net::NetError),
}
