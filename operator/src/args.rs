use clap::{Parser, Subcommand};
use snaprestore_common::args::{ElasticArgs, PostgresArgs, RestoreArgs};

#[derive(Parser, Debug)]
#[command(name = "snaprestore")]
#[command(about = "Restores Elasticsearch indices from snapshots onto dedicated restore nodes")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the RestoreTask controller and the restore worker pool
    Controller(ControllerArgs),

    /// Run the intake API and the catalog indexer
    Server(ServerArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct ControllerArgs {
    #[clap(flatten)]
    pub postgres: PostgresArgs,

    #[clap(flatten)]
    pub elastic: ElasticArgs,

    #[clap(flatten)]
    pub restore: RestoreArgs,
}

#[derive(Parser, Debug, Clone)]
pub struct ServerArgs {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Namespace where RestoreTask resources are created
    #[arg(long, env = "NAMESPACE", default_value = "default")]
    pub namespace: String,

    #[clap(flatten)]
    pub postgres: PostgresArgs,

    #[clap(flatten)]
    pub elastic: ElasticArgs,

    #[clap(flatten)]
    pub restore: RestoreArgs,
}
