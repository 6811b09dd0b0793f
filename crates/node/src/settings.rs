//! Node settings: `stakd.conf` in the data directory, overridden by `-key=value`
//! command line arguments.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use stakd_chainstate::ChainSettings;
use stakd_consensus::constants::MAX_OP_META_RELAY;
use stakd_consensus::{chain_params, ChainParams, Network};
use stakd_log::{Category, Format, Level, LogConfig};

use crate::policy::{
    MempoolPolicy, DEFAULT_LIMIT_FREE_RELAY, DEFAULT_MAX_ORPHAN_TRANSACTIONS,
    DEFAULT_MIN_RELAY_TX_FEE,
};

pub const CONF_FILE_NAME: &str = "stakd.conf";
const DEFAULT_DATA_DIR_NAME: &str = ".stakd";

/// Keys that accept the `-nokey` negation.
const BOOL_KEYS: &[&str] = &[
    "testnet",
    "regtest",
    "checkpoints",
    "checkblockindex",
    "requirestandard",
    "acceptnonstdtxn",
    "datacarrier",
    "permitbaremultisig",
    "relaypriority",
    "logtimestamps",
];

#[derive(Debug)]
pub enum SettingsError {
    Io { path: PathBuf, err: std::io::Error },
    InvalidValue { key: String, value: String },
    MissingValue(String),
    UnknownArgument(String),
}

impl std::fmt::Display for SettingsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SettingsError::Io { path, err } => {
                write!(f, "failed to read {}: {err}", path.display())
            }
            SettingsError::InvalidValue { key, value } => {
                write!(f, "invalid value '{value}' for -{key}")
            }
            SettingsError::MissingValue(key) => write!(f, "missing value for -{key}"),
            SettingsError::UnknownArgument(arg) => write!(f, "unknown argument {arg}"),
        }
    }
}

impl std::error::Error for SettingsError {}

pub enum CliAction {
    Run(Settings),
    PrintHelp,
    PrintVersion,
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub network: Network,
    /// Network-specific directory holding the databases and block files.
    pub data_dir: PathBuf,
    pub conf_path: PathBuf,
    pub max_reorg_depth: Option<i32>,
    pub checkpoints: bool,
    /// `None` keeps the network default.
    pub check_block_index: Option<bool>,
    pub limit_free_relay: u64,
    /// `None` keeps the network default.
    pub require_standard: Option<bool>,
    pub datacarrier: bool,
    pub datacarrier_size: usize,
    pub permit_bare_multisig: bool,
    pub min_relay_tx_fee: i64,
    pub relay_priority: bool,
    pub max_orphan_tx: usize,
    pub log_level: Level,
    pub log_format: Format,
    pub log_timestamps: bool,
    pub debug_categories: Vec<Category>,
    /// Conf file keys this build does not know; reported once logging is up.
    pub ignored_conf_keys: Vec<String>,
}

impl Settings {
    pub fn new(network: Network, data_dir: PathBuf, conf_path: PathBuf) -> Self {
        Self {
            network,
            data_dir,
            conf_path,
            max_reorg_depth: None,
            checkpoints: true,
            check_block_index: None,
            limit_free_relay: DEFAULT_LIMIT_FREE_RELAY,
            require_standard: None,
            datacarrier: true,
            datacarrier_size: MAX_OP_META_RELAY,
            permit_bare_multisig: true,
            min_relay_tx_fee: DEFAULT_MIN_RELAY_TX_FEE,
            relay_priority: true,
            max_orphan_tx: DEFAULT_MAX_ORPHAN_TRANSACTIONS,
            log_level: Level::Info,
            log_format: Format::Text,
            log_timestamps: true,
            debug_categories: Vec::new(),
            ignored_conf_keys: Vec::new(),
        }
    }

    pub fn chain_params(&self) -> ChainParams {
        chain_params(self.network)
    }

    pub fn chain_settings(&self, params: &ChainParams) -> ChainSettings {
        let mut settings = ChainSettings::for_params(params);
        if let Some(depth) = self.max_reorg_depth {
            settings.max_reorg_depth = depth;
        }
        settings.checkpoints_enabled = self.checkpoints;
        if let Some(check) = self.check_block_index {
            settings.check_block_index = check;
        }
        settings
    }

    pub fn mempool_policy(&self, params: &ChainParams) -> MempoolPolicy {
        let require_standard = self.require_standard.unwrap_or(params.require_standard);
        let mut policy = MempoolPolicy::standard(self.min_relay_tx_fee, require_standard);
        policy.limit_free_relay_kb_per_minute = self.limit_free_relay;
        policy.relay_priority = self.relay_priority;
        policy.max_datacarrier_bytes = self.datacarrier.then_some(self.datacarrier_size);
        policy.permit_bare_multisig = self.permit_bare_multisig;
        policy.max_orphans = self.max_orphan_tx;
        policy
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: self.log_level,
            format: self.log_format,
            timestamps: self.log_timestamps,
            categories: self.debug_categories.clone(),
        }
    }

    /// Applies one setting. Returns `Ok(false)` when the key is not recognised.
    fn apply(&mut self, key: &str, value: &str) -> Result<bool, SettingsError> {
        match key {
            "maxreorgdepth" => {
                let depth = parse_number::<i32>(key, value)?;
                if depth < 0 {
                    return Err(invalid(key, value));
                }
                self.max_reorg_depth = Some(depth);
            }
            "checkpoints" => self.checkpoints = parse_bool(key, value)?,
            "checkblockindex" => self.check_block_index = Some(parse_bool(key, value)?),
            "limitfreerelay" => self.limit_free_relay = parse_number(key, value)?,
            "requirestandard" => self.require_standard = Some(parse_bool(key, value)?),
            "acceptnonstdtxn" => self.require_standard = Some(!parse_bool(key, value)?),
            "datacarrier" => self.datacarrier = parse_bool(key, value)?,
            "datacarriersize" => self.datacarrier_size = parse_number(key, value)?,
            "permitbaremultisig" => self.permit_bare_multisig = parse_bool(key, value)?,
            "minrelaytxfee" => {
                let fee = parse_number::<i64>(key, value)?;
                if fee < 0 {
                    return Err(invalid(key, value));
                }
                self.min_relay_tx_fee = fee;
            }
            "relaypriority" => self.relay_priority = parse_bool(key, value)?,
            "maxorphantx" => self.max_orphan_tx = parse_number(key, value)?,
            "loglevel" => {
                self.log_level = Level::parse(value).ok_or_else(|| invalid(key, value))?;
            }
            "logformat" => {
                self.log_format = Format::parse(value).ok_or_else(|| invalid(key, value))?;
            }
            "logtimestamps" => self.log_timestamps = parse_bool(key, value)?,
            "debug" => self.apply_debug(value)?,
            // consumed while locating the conf file
            "network" | "testnet" | "regtest" | "datadir" | "conf" => {}
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn apply_debug(&mut self, value: &str) -> Result<(), SettingsError> {
        let value = value.trim().to_ascii_lowercase();
        match value.as_str() {
            "" | "1" | "all" => self.debug_categories = Category::ALL.to_vec(),
            "0" | "none" => self.debug_categories.clear(),
            _ => {
                for name in value.split(',') {
                    let category =
                        Category::parse(name).ok_or_else(|| invalid("debug", name))?;
                    if !self.debug_categories.contains(&category) {
                        self.debug_categories.push(category);
                    }
                }
            }
        }
        Ok(())
    }
}

pub fn parse_args() -> Result<CliAction, SettingsError> {
    parse_args_from(std::env::args().skip(1))
}

/// Parses command line arguments, without the program name, and the conf file
/// they point at.
pub fn parse_args_from<I>(raw_args: I) -> Result<CliAction, SettingsError>
where
    I: IntoIterator<Item = String>,
{
    let mut cli: Vec<(String, String)> = Vec::new();
    for arg in raw_args {
        match arg.as_str() {
            "-h" | "-help" | "--help" | "-?" => return Ok(CliAction::PrintHelp),
            "-version" | "--version" => return Ok(CliAction::PrintVersion),
            _ => {}
        }
        let Some(stripped) = arg.strip_prefix("--").or_else(|| arg.strip_prefix('-')) else {
            return Err(SettingsError::UnknownArgument(arg));
        };
        let (key, value) = match stripped.split_once('=') {
            Some((key, value)) => (key.to_ascii_lowercase(), value.to_string()),
            None => negated(&stripped.to_ascii_lowercase()),
        };
        if key.is_empty() {
            return Err(SettingsError::UnknownArgument(arg));
        }
        cli.push((key, value));
    }

    let data_root = match last_value(&cli, "datadir") {
        Some(dir) if dir.is_empty() => return Err(SettingsError::MissingValue("datadir".into())),
        Some(dir) => PathBuf::from(dir),
        None => default_data_dir(),
    };
    let conf_path = match last_value(&cli, "conf") {
        Some(path) => {
            let path = PathBuf::from(path);
            if path.is_relative() {
                data_root.join(path)
            } else {
                path
            }
        }
        None => data_root.join(CONF_FILE_NAME),
    };
    let conf = load_conf(&conf_path)?.unwrap_or_default();
    let mut conf_pairs: Vec<(String, String)> = Vec::new();
    let mut keys: Vec<&String> = conf.keys().collect();
    keys.sort();
    for key in keys {
        for value in &conf[key] {
            conf_pairs.push((key.clone(), value.clone()));
        }
    }

    let network = match select_network(&cli)? {
        Some(network) => network,
        None => select_network(&conf_pairs)?.unwrap_or(Network::Mainnet),
    };
    let data_dir = network_data_dir(&data_root, network);
    let mut settings = Settings::new(network, data_dir, conf_path);

    for (key, value) in &conf_pairs {
        if !settings.apply(key, value)? {
            settings.ignored_conf_keys.push(key.clone());
        }
    }
    for (key, value) in &cli {
        if !settings.apply(key, value)? {
            return Err(SettingsError::UnknownArgument(format!("-{key}")));
        }
    }
    Ok(CliAction::Run(settings))
}

/// `-nokey` for a boolean key means `-key=0`; any other bare flag means `-key=1`.
fn negated(key: &str) -> (String, String) {
    if let Some(rest) = key.strip_prefix("no") {
        if BOOL_KEYS.contains(&rest) {
            return (rest.to_string(), "0".to_string());
        }
    }
    (key.to_string(), "1".to_string())
}

fn last_value<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .rev()
        .find(|(candidate, _)| candidate == key)
        .map(|(_, value)| value.as_str())
}

fn select_network(pairs: &[(String, String)]) -> Result<Option<Network>, SettingsError> {
    let mut selected = None;
    for (key, value) in pairs {
        let network = match key.as_str() {
            "network" => Some(Network::parse(value).ok_or_else(|| invalid(key, value))?),
            "testnet" => parse_bool(key, value)?.then_some(Network::Testnet),
            "regtest" => parse_bool(key, value)?.then_some(Network::Regtest),
            _ => None,
        };
        if network.is_some() {
            selected = network;
        }
    }
    Ok(selected)
}

pub fn default_data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DEFAULT_DATA_DIR_NAME)
}

pub fn network_data_dir(root: &Path, network: Network) -> PathBuf {
    match network {
        Network::Mainnet => root.to_path_buf(),
        Network::Testnet => root.join("testnet"),
        Network::Regtest => root.join("regtest"),
    }
}

/// Reads `key=value` lines. `#` and `;` start comments, a bare key means `1`,
/// keys are case-insensitive and may repeat. A missing file is not an error.
pub fn load_conf(path: &Path) -> Result<Option<HashMap<String, Vec<String>>>, SettingsError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(SettingsError::Io {
                path: path.to_path_buf(),
                err,
            })
        }
    };

    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for raw_line in contents.lines() {
        let mut line = raw_line.trim();
        if let Some(idx) = line.find(['#', ';']) {
            line = &line[..idx];
        }
        line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (line, "1"),
        };
        if key.is_empty() {
            continue;
        }
        let key = key.trim_start_matches('-').to_ascii_lowercase();
        out.entry(key).or_default().push(value.to_string());
    }
    Ok(Some(out))
}

pub fn parse_conf_bool(value: &str) -> Option<bool> {
    let value = value.trim();
    if value.is_empty() {
        return Some(true);
    }
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, SettingsError> {
    parse_conf_bool(value).ok_or_else(|| invalid(key, value))
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, SettingsError> {
    value.trim().parse().map_err(|_| invalid(key, value))
}

fn invalid(key: &str, value: &str) -> SettingsError {
    SettingsError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

pub fn usage() -> String {
    format!(
        "\
stakd {version}

Usage: stakd [options]

Options are read from <datadir>/{conf} and may be given as -key=value.

  -datadir=<dir>            Data directory (default: ~/{dir})
  -conf=<file>              Config file, relative to the data directory
  -network=<name>           main, testnet or regtest (also -testnet, -regtest)
  -maxreorgdepth=<n>        Refuse reorganizations deeper than n blocks
  -checkpoints=<0|1>        Enforce built-in checkpoints (default: 1)
  -checkblockindex=<0|1>    Verify the block index after every change
  -requirestandard=<0|1>    Only relay standard transactions
  -acceptnonstdtxn=<0|1>    Inverse of -requirestandard
  -datacarrier=<0|1>        Relay OP_META data outputs (default: 1)
  -datacarriersize=<n>      Largest relayed data output script (default: {meta})
  -permitbaremultisig=<0|1> Relay bare multisig outputs (default: 1)
  -minrelaytxfee=<sat>      Relay fee per 1000 bytes (default: {fee})
  -limitfreerelay=<n>       Free transactions, thousands of bytes per minute (default: {free})
  -relaypriority=<0|1>      Free transactions need coin-age priority (default: 1)
  -maxorphantx=<n>          Orphan transactions kept in memory (default: {orphans})
  -debug=<category>         validation, mempool, chain, index, bench, or all
  -loglevel=<level>         error, warn, info, debug or trace
  -logformat=<text|json>    Log line format
  -logtimestamps=<0|1>      Prefix log lines with a timestamp (default: 1)
  -help                     Print this help
  -version                  Print the version",
        version = env!("CARGO_PKG_VERSION"),
        conf = CONF_FILE_NAME,
        dir = DEFAULT_DATA_DIR_NAME,
        meta = MAX_OP_META_RELAY,
        fee = DEFAULT_MIN_RELAY_TX_FEE,
        free = DEFAULT_LIMIT_FREE_RELAY,
        orphans = DEFAULT_MAX_ORPHAN_TRANSACTIONS,
    )
}
