//! CLI command definitions

use clap::{Parser, Subcommand};
use convoy::auth::DEFAULT_CREDENTIALS_PATH;
use convoy::server::{
    DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_PORT, DEFAULT_PUBLIC_DIR, DEFAULT_QUEUE_CAPACITY,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "convoy")]
#[command(about = "Real-time presence and vehicle location relay", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Credentials file for the token backend (dev mode if missing)
    #[arg(long, env = "CONVOY_CREDENTIALS", default_value = DEFAULT_CREDENTIALS_PATH, global = true)]
    pub credentials: PathBuf,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the relay server
    Serve {
        /// Address to bind to
        #[arg(long, env = "CONVOY_HOST", default_value = "0.0.0.0")]
        host: String,

        /// Port to listen on
        #[arg(short, long, env = "PORT", default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Directory of static assets
        #[arg(long, env = "CONVOY_PUBLIC_DIR", default_value = DEFAULT_PUBLIC_DIR)]
        public_dir: PathBuf,

        /// Outbound queue capacity per connection
        #[arg(long, env = "CONVOY_QUEUE_CAPACITY", default_value_t = DEFAULT_QUEUE_CAPACITY)]
        queue_capacity: usize,

        /// Seconds a new socket may take to send its auth frame
        #[arg(long, env = "CONVOY_HANDSHAKE_TIMEOUT", default_value_t = DEFAULT_HANDSHAKE_TIMEOUT.as_secs())]
        handshake_timeout_secs: u64,
    },

    /// Generate a credentials file with a random signing secret
    ///
    /// Examples:
    ///   convoy keygen
    ///   convoy keygen --issuer rides-prod --credentials /etc/convoy/credentials.json
    Keygen {
        /// Issuer name embedded in minted tokens
        #[arg(long, default_value = "convoy")]
        issuer: String,

        /// Overwrite an existing credentials file
        #[arg(long)]
        force: bool,
    },

    /// Mint an identity token signed with the credentials file
    ///
    /// Examples:
    ///   convoy mint --subject driver-42
    ///   convoy mint --subject rider-7 --ttl-secs 600
    Mint {
        /// Subject (user id) the token is issued to
        #[arg(long)]
        subject: String,

        /// Token lifetime in seconds
        #[arg(long, default_value_t = 3600)]
        ttl_secs: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_defaults() {
        // PORT may be set in the environment, so pass it explicitly
        let cli = Cli::try_parse_from(["convoy", "serve", "--port", "8080"]).unwrap();

        assert_eq!(cli.credentials, PathBuf::from("credentials.json"));
        match cli.command {
            Commands::Serve {
                host,
                port,
                public_dir,
                queue_capacity,
                handshake_timeout_secs,
            } => {
                assert_eq!(host, "0.0.0.0");
                assert_eq!(port, 8080);
                assert_eq!(public_dir, PathBuf::from("public"));
                assert_eq!(queue_capacity, 256);
                assert_eq!(handshake_timeout_secs, 10);
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn test_mint_requires_subject() {
        assert!(Cli::try_parse_from(["convoy", "mint"]).is_err());

        let cli = Cli::try_parse_from(["convoy", "mint", "--subject", "u1", "--ttl-secs", "60"]).unwrap();
        match cli.command {
            Commands::Mint { subject, ttl_secs } => {
                assert_eq!(subject, "u1");
                assert_eq!(ttl_secs, 60);
            }
            _ => panic!("expected mint"),
        }
    }

    #[test]
    fn test_global_credentials_flag() {
        let cli = Cli::try_parse_from(["convoy", "keygen", "--credentials", "/tmp/c.json", "--force"])
            .unwrap();

        assert_eq!(cli.credentials, PathBuf::from("/tmp/c.json"));
        assert!(matches!(cli.command, Commands::Keygen { force: true, .. }));
    }
}
