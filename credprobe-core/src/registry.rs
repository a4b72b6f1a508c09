//! Protocol-to-connector dispatch. The match is exhaustive on purpose:
//! adding a protocol without wiring its connector does not compile.

use credprobe_connectors::{
    AdbConnector, Connector, DockerConnector, ElasticsearchConnector, EtcdConnector, FtpConnector,
    JdwpConnector, KafkaConnector, KubernetesConnector, MemcachedConnector, MongoDbConnector,
    MqttConnector, MySqlConnector, OracleConnector, PostgresConnector, RabbitMqConnector,
    RdpConnector, RedisConnector, RmiConnector, SftpConnector, SmbConnector, SqlServerConnector,
    SshConnector, VncConnector, WmiConnector, ZookeeperConnector,
};
use credprobe_types::Protocol;

#[derive(Debug, Clone, Copy, Default)]
pub struct Registry;

impl Registry {
    pub fn connector(&self, protocol: Protocol) -> &'static dyn Connector {
        match protocol {
            Protocol::Redis => &RedisConnector,
            Protocol::Memcached => &MemcachedConnector,
            Protocol::MySql => &MySqlConnector,
            Protocol::Postgres => &PostgresConnector,
            Protocol::MongoDb => &MongoDbConnector,
            Protocol::Ssh => &SshConnector,
            Protocol::Sftp => &SftpConnector,
            Protocol::SqlServer => &SqlServerConnector,
            Protocol::Oracle => &OracleConnector,
            Protocol::Ftp => &FtpConnector,
            Protocol::Smb => &SmbConnector,
            Protocol::RabbitMq => &RabbitMqConnector,
            Protocol::Mqtt => &MqttConnector,
            Protocol::Wmi => &WmiConnector,
            Protocol::Elasticsearch => &ElasticsearchConnector,
            Protocol::Zookeeper => &ZookeeperConnector,
            Protocol::Adb => &AdbConnector,
            Protocol::Kafka => &KafkaConnector,
            Protocol::Etcd => &EtcdConnector,
            Protocol::Jdwp => &JdwpConnector,
            Protocol::Rmi => &RmiConnector,
            Protocol::Vnc => &VncConnector,
            Protocol::Rdp => &RdpConnector,
            Protocol::Docker => &DockerConnector,
            Protocol::Kubernetes => &KubernetesConnector,
        }
    }
}
