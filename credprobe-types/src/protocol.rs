use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The closed set of service families the engine can probe.
///
/// Dispatch over this enum is exhaustive: adding a variant forces every
/// `match` (connector registry, default ports, display) to be updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Redis,
    Memcached,
    MySql,
    Postgres,
    MongoDb,
    Ssh,
    Sftp,
    SqlServer,
    Oracle,
    Ftp,
    Smb,
    RabbitMq,
    Mqtt,
    Wmi,
    Elasticsearch,
    Zookeeper,
    Adb,
    Kafka,
    Etcd,
    Jdwp,
    Rmi,
    Vnc,
    Rdp,
    Docker,
    Kubernetes,
}

impl Protocol {
    pub const ALL: [Protocol; 25] = [
        Protocol::Redis,
        Protocol::Memcached,
        Protocol::MySql,
        Protocol::Postgres,
        Protocol::MongoDb,
        Protocol::Ssh,
        Protocol::Sftp,
        Protocol::SqlServer,
        Protocol::Oracle,
        Protocol::Ftp,
        Protocol::Smb,
        Protocol::RabbitMq,
        Protocol::Mqtt,
        Protocol::Wmi,
        Protocol::Elasticsearch,
        Protocol::Zookeeper,
        Protocol::Adb,
        Protocol::Kafka,
        Protocol::Etcd,
        Protocol::Jdwp,
        Protocol::Rmi,
        Protocol::Vnc,
        Protocol::Rdp,
        Protocol::Docker,
        Protocol::Kubernetes,
    ];

    /// Conventional port for the service, used when a target omits one.
    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::Redis => 6379,
            Protocol::Memcached => 11211,
            Protocol::MySql => 3306,
            Protocol::Postgres => 5432,
            Protocol::MongoDb => 27017,
            Protocol::Ssh => 22,
            Protocol::Sftp => 22,
            Protocol::SqlServer => 1433,
            Protocol::Oracle => 1521,
            Protocol::Ftp => 21,
            Protocol::Smb => 445,
            Protocol::RabbitMq => 5672,
            Protocol::Mqtt => 1883,
            Protocol::Wmi => 135,
            Protocol::Elasticsearch => 9200,
            Protocol::Zookeeper => 2181,
            Protocol::Adb => 5555,
            Protocol::Kafka => 9092,
            Protocol::Etcd => 2379,
            Protocol::Jdwp => 8000,
            Protocol::Rmi => 1099,
            Protocol::Vnc => 5900,
            Protocol::Rdp => 3389,
            Protocol::Docker => 2375,
            Protocol::Kubernetes => 6443,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::Redis => "redis",
            Protocol::Memcached => "memcached",
            Protocol::MySql => "mysql",
            Protocol::Postgres => "postgresql",
            Protocol::MongoDb => "mongodb",
            Protocol::Ssh => "ssh",
            Protocol::Sftp => "sftp",
            Protocol::SqlServer => "sqlserver",
            Protocol::Oracle => "oracle",
            Protocol::Ftp => "ftp",
            Protocol::Smb => "smb",
            Protocol::RabbitMq => "rabbitmq",
            Protocol::Mqtt => "mqtt",
            Protocol::Wmi => "wmi",
            Protocol::Elasticsearch => "elasticsearch",
            Protocol::Zookeeper => "zookeeper",
            Protocol::Adb => "adb",
            Protocol::Kafka => "kafka",
            Protocol::Etcd => "etcd",
            Protocol::Jdwp => "jdwp",
            Protocol::Rmi => "rmi",
            Protocol::Vnc => "vnc",
            Protocol::Rdp => "rdp",
            Protocol::Docker => "docker",
            Protocol::Kubernetes => "kubernetes",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown protocol type: {0}")]
pub struct ProtocolParseError(pub String);

impl FromStr for Protocol {
    type Err = ProtocolParseError;

    /// Case-insensitive, with the aliases import files commonly use.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(Protocol::Redis),
            "memcached" | "memcache" => Ok(Protocol::Memcached),
            "mysql" | "mariadb" => Ok(Protocol::MySql),
            "postgresql" | "postgres" | "pgsql" => Ok(Protocol::Postgres),
            "mongodb" | "mongo" => Ok(Protocol::MongoDb),
            "ssh" => Ok(Protocol::Ssh),
            "sftp" => Ok(Protocol::Sftp),
            "sqlserver" | "mssql" | "sql" => Ok(Protocol::SqlServer),
            "oracle" => Ok(Protocol::Oracle),
            "ftp" => Ok(Protocol::Ftp),
            "smb" | "samba" | "cifs" => Ok(Protocol::Smb),
            "rabbitmq" | "amqp" => Ok(Protocol::RabbitMq),
            "mqtt" => Ok(Protocol::Mqtt),
            "wmi" => Ok(Protocol::Wmi),
            "elasticsearch" | "es" => Ok(Protocol::Elasticsearch),
            "zookeeper" | "zk" => Ok(Protocol::Zookeeper),
            "adb" => Ok(Protocol::Adb),
            "kafka" => Ok(Protocol::Kafka),
            "etcd" => Ok(Protocol::Etcd),
            "jdwp" => Ok(Protocol::Jdwp),
            "rmi" => Ok(Protocol::Rmi),
            "vnc" => Ok(Protocol::Vnc),
            "rdp" => Ok(Protocol::Rdp),
            "docker" => Ok(Protocol::Docker),
            "kubernetes" | "k8s" => Ok(Protocol::Kubernetes),
            other => Err(ProtocolParseError(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_aliases() {
        assert_eq!("Redis".parse::<Protocol>().unwrap(), Protocol::Redis);
        assert_eq!("POSTGRES".parse::<Protocol>().unwrap(), Protocol::Postgres);
        assert_eq!("mssql".parse::<Protocol>().unwrap(), Protocol::SqlServer);
        assert_eq!("k8s".parse::<Protocol>().unwrap(), Protocol::Kubernetes);
        assert_eq!("cifs".parse::<Protocol>().unwrap(), Protocol::Smb);
        assert!("gopher".parse::<Protocol>().is_err());
    }

    #[test]
    fn display_round_trips() {
        for proto in Protocol::ALL {
            assert_eq!(proto.to_string().parse::<Protocol>().unwrap(), proto);
        }
    }

    #[test]
    fn all_covers_every_variant_once() {
        let mut seen = std::collections::HashSet::new();
        for proto in Protocol::ALL {
            assert!(seen.insert(proto));
        }
        assert_eq!(seen.len(), 25);
    }
}
