//! ktlog - Key Transparency Log Server
//!
//! Run modes:
//!   cargo run -- api             - Start the log server
//!   cargo run -- keygen          - Generate signing and VRF key seeds
//!   cargo run -- demo            - Run an end-to-end demo in memory

use std::env;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use ktlog::api::{self, AppState};
use ktlog::crypto::{SigningKeyPair, VrfPrivateKey};
use ktlog::wire::{DeploymentMode, PublicConfig, SearchRequest, UpdateValue};
use ktlog::{
    init_from_config, sequencer, KtConfig, MemoryStore, SearchVerifier, SqliteStore,
    TransparencyLog, TransparencyStore,
};

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return;
    }

    match args[1].as_str() {
        "api" => run_api_server(&args[2..]).await,
        "keygen" => run_keygen(),
        "demo" => run_demo().await,
        "help" | "--help" | "-h" => print_usage(),
        _ => print_usage(),
    }
}

fn print_usage() {
    println!("ktlog - Key Transparency Log Server");
    println!();
    println!("Usage:");
    println!("  ktlog-api api [--port <port>]    Start the log server (default: 3001)");
    println!("  ktlog-api keygen                 Generate signing and VRF key seeds");
    println!("  ktlog-api demo                   Run an end-to-end demo in memory");
    println!();
    println!("Environment Variables:");
    println!("  KTLOG_ENV                production or development");
    println!("  KTLOG_DB_PATH            SQLite path; empty runs in memory");
    println!("  KTLOG_SIGNING_SEED       Hex-encoded signing key seed");
    println!("  KTLOG_VRF_SEED           Hex-encoded VRF key seed");
    println!("  KTLOG_PORT               REST API port (default: 3001)");
    println!("  KTLOG_MAX_AHEAD          Clock skew tolerance, ms");
    println!("  KTLOG_MAX_BEHIND         Staleness tolerance, ms");
    println!("  KTLOG_MONITORING_WINDOW  Reasonable monitoring window, ms");
    println!("  KTLOG_MAX_LIFETIME       Entry lifetime, ms; 0 disables expiry");
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before the epoch")
        .as_millis() as u64
}

/// Assemble the transparency log from deployment configuration.
fn build_log(config: &KtConfig) -> ktlog::Result<Arc<TransparencyLog>> {
    let signing = match config.signing_seed {
        Some(seed) => SigningKeyPair::from_seed(&seed),
        None => SigningKeyPair::generate(),
    };
    let mut rng = StdRng::from_entropy();
    let vrf = match config.vrf_seed {
        Some(seed) => VrfPrivateKey::from_seed(&seed),
        None => VrfPrivateKey::generate(&mut rng),
    };
    let public = PublicConfig {
        suite_id: 1,
        mode: DeploymentMode::ContactMonitoring,
        signature_public_key: signing.public_key_bytes().to_vec(),
        vrf_public_key: vrf.public_key().to_bytes().to_vec(),
        max_ahead: config.max_ahead,
        max_behind: config.max_behind,
        reasonable_monitoring_window: config.reasonable_monitoring_window,
        maximum_lifetime: config.maximum_lifetime,
    };
    let store: Box<dyn TransparencyStore> = match &config.db_path {
        Some(path) => Box::new(SqliteStore::new(path)?),
        None => Box::new(MemoryStore::new()),
    };
    let log = TransparencyLog::new(
        public,
        signing,
        vrf,
        store,
        Box::new(rng),
        Box::new(now_ms),
    )?;
    Ok(Arc::new(log))
}

async fn run_api_server(args: &[String]) {
    let config = match KtConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return;
        }
    };
    if let Err(e) = init_from_config(&config) {
        eprintln!("Logging error: {e}");
        return;
    }
    if config.environment == ktlog::Environment::Production {
        if let Err(e) = config.validate_for_production() {
            eprintln!("Not production ready: {e}");
            return;
        }
    }
    config.print_summary();

    let mut port = config.port;
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--port" if i + 1 < args.len() => {
                port = args[i + 1].parse().unwrap_or(config.port);
                i += 2;
            }
            _ => i += 1,
        }
    }

    let log = match build_log(&config) {
        Ok(log) => log,
        Err(e) => {
            eprintln!("Startup error: {e}");
            return;
        }
    };
    let handle = sequencer::spawn(log.clone(), 256);
    let state = Arc::new(AppState {
        log,
        sequencer: handle,
        mutate_timeout: Duration::from_secs(30),
    });

    if let Err(e) = api::start_server(state, port).await {
        eprintln!("API server error: {e}");
    }
}

fn run_keygen() {
    let mut rng = StdRng::from_entropy();
    let mut signing_seed = [0u8; 32];
    rng.fill_bytes(&mut signing_seed);
    let mut vrf_seed = [0u8; 32];
    rng.fill_bytes(&mut vrf_seed);

    let signing = SigningKeyPair::from_seed(&signing_seed);
    let vrf = VrfPrivateKey::from_seed(&vrf_seed);

    println!("KTLOG_SIGNING_SEED={}", hex::encode(signing_seed));
    println!("KTLOG_VRF_SEED={}", hex::encode(vrf_seed));
    println!();
    println!("Signature public key: {}", hex::encode(signing.public_key_bytes()));
    println!("VRF public key:       {}", hex::encode(vrf.public_key().to_bytes()));
}

async fn run_demo() {
    println!("\n=== ktlog Demo ===\n");

    let config = KtConfig::from_env().expect("demo uses defaults");
    let log = build_log(&config).expect("in-memory startup");
    let public = log.public_config().clone();

    // Write a few versions for one label.
    for (i, value) in [b"key-one", b"key-two"].iter().enumerate() {
        let update = UpdateValue {
            prefix: None,
            value: value.to_vec(),
        };
        let outcome = log
            .mutate(&[(b"alice@example.com".to_vec(), update)], &[])
            .await
            .expect("mutation");
        println!(
            "Mutation {}: tree size {}, root {}",
            i + 1,
            outcome.tree_size,
            hex::encode(outcome.root)
        );
    }

    // Search for the latest version and verify the response end to end.
    let req = SearchRequest {
        last: None,
        label: b"alice@example.com".to_vec(),
        version: None,
    };
    let res = log.search(&req).await.expect("search");
    println!("\nSearch response: {} bytes on the wire", res.encode().len());

    let mut verifier = SearchVerifier::new(public).expect("verifier");
    let verified = verifier
        .verify(&req, &res, now_ms())
        .await
        .expect("verification");
    println!(
        "Verified: version {} at log position {}, value {:?}",
        verified.version,
        verified.position,
        String::from_utf8_lossy(&verified.value)
    );
    println!("Retained tree size: {:?}", verifier.last_size());

    println!("\n=== Demo Complete ===");
}
