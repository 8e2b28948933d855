use clap::Parser;
use tracing::Level;

#[derive(Parser)]
#[command(version)]
pub struct CliOpts {
	/// Path to the toml configuration file
	#[arg(short, long, value_name = "FILE")]
	pub config: Option<String>,
	/// Path to the data directory, where blocks and peers are stored
	#[arg(long)]
	pub data_path: Option<String>,
	/// Run a clean node, deleting the existing data directory
	#[arg(long)]
	pub clean: bool,
	/// Log level
	#[arg(long)]
	pub verbosity: Option<Level>,
	/// Set logs format to JSON
	#[arg(long)]
	pub logs_json: bool,
	/// Currency name of the network
	#[arg(long)]
	pub currency: Option<String>,
	/// Public port announced in the self peering document
	#[arg(short, long)]
	pub port: Option<u16>,
	/// Endpoint of a node to fetch the first peer and the genesis block from
	/// (e.g. "BASIC_MERKLED_API node.example.org 8999")
	#[arg(long, value_name = "ENDPOINT")]
	pub bootstrap: Option<String>,
}
