//! Enclave CLI — Root CA, sealing, attestation and orderer keys
//!
//! Commands:
//!   enclave init        — generate and seal the Root CA
//!   enclave status      — show enclave identity and persisted state
//!   enclave cert        — print the Root CA certificate
//!   enclave sign        — issue a certificate for a CSR
//!   enclave seal        — seal a file to this enclave
//!   enclave unseal      — unseal a file sealed by this enclave
//!   enclave quote       — generate an attestation quote
//!   enclave verify      — verify a quote against the trust policy
//!   enclave trust       — add a quote's measurements to the trust policy
//!   enclave orderer-key — generate a sealed orderer key for a chain
//!   enclave orderer-import — seal an existing PKCS#8 key for a chain
//!   enclave sign-block  — sign a block with a chain's orderer key
//!   enclave demo        — run the full flow in a scratch directory

use enclave_core::ca::CertType;
use enclave_core::config::EnclaveConfig;
use enclave_core::orderer::verify_block_signature;
use enclave_core::service::EnclaveService;
use enclave_core::tee::{TeeError, TeeResult, VerificationFailure};
use std::env;
use std::path::{Path, PathBuf};
use std::process;

fn print_usage() {
    println!(
        r#"
╔══════════════════════════════════════════════════════════════╗
║        Enclave Trust Service                                 ║
║        Root CA + Sealing + Attestation + Orderer Keys        ║
╚══════════════════════════════════════════════════════════════╝

Usage: enclave [--config <file>] <command> [options]

Commands:
  init                                 Generate and seal the Root CA
  status                               Show enclave identity and state
  cert                                 Print the Root CA certificate (PEM)
  sign        <csr.pem> <type> [days]  Issue a certificate
                                       (type: intermediate-ca|orderer|peer|client)
  seal        <in> <out>               Seal a file to this enclave
  unseal      <in> <out>               Unseal a file
  quote       [report-data]            Generate an attestation quote (JSON)
  verify      <quote.json>             Verify a quote against the trust policy
  trust       <quote.json>             Trust the quote's MRENCLAVE/MRSIGNER
  orderer-key <chain>                  Generate a sealed orderer key
  orderer-import <chain> <key.pem>     Seal an existing PKCS#8 orderer key
  sign-block  <chain> <file>           Sign a block, print hex signature
  demo                                 Run the full flow in a scratch directory

Environment:
  ENCLAVE_CONFIG     config file (TOML), overridden by --config
  ENCLAVE_DATA_DIR   data directory override
  RUST_LOG           log filter (default: info)

Examples:
  enclave init
  enclave sign orderer0.csr orderer 825 > orderer0.pem
  enclave quote block-12345 > quote.json
  enclave verify quote.json
  enclave orderer-key hot
"#
    );
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let mut args: Vec<String> = env::args().skip(1).collect();
    let config_path = match take_config_flag(&mut args) {
        Ok(path) => path,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    };
    if args.is_empty() {
        print_usage();
        return;
    }

    let command = args[0].clone();
    let rest = &args[1..];
    let result = match command.as_str() {
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        "demo" => cmd_demo().await,
        _ => match open_service(config_path.as_deref()) {
            Ok(service) => dispatch(&service, &command, rest).await,
            Err(e) => Err(e),
        },
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

async fn dispatch(service: &EnclaveService, command: &str, args: &[String]) -> TeeResult<()> {
    match command {
        "init" => cmd_init(service).await,
        "status" => cmd_status(service).await,
        "cert" => cmd_cert(service).await,
        "sign" => cmd_sign(service, args).await,
        "seal" => cmd_seal(service, args).await,
        "unseal" => cmd_unseal(service, args).await,
        "quote" => cmd_quote(service, args).await,
        "verify" => cmd_verify(service, args).await,
        "trust" => cmd_trust(service, args).await,
        "orderer-key" => cmd_orderer_key(service, args).await,
        "orderer-import" => cmd_orderer_import(service, args).await,
        "sign-block" => cmd_sign_block(service, args).await,
        other => {
            print_usage();
            Err(TeeError::InvalidArgument(format!("unknown command: {}", other)))
        }
    }
}

/// Remove `--config <file>` from the argument list
fn take_config_flag(args: &mut Vec<String>) -> TeeResult<Option<PathBuf>> {
    match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => {
            let path = PathBuf::from(args.remove(i + 1));
            args.remove(i);
            Ok(Some(path))
        }
        Some(_) => Err(TeeError::InvalidArgument("--config needs a file argument".into())),
        None => Ok(None),
    }
}

fn open_service(config_path: Option<&Path>) -> TeeResult<EnclaveService> {
    let config = EnclaveConfig::load(config_path)?;
    log::debug!("Configuration: {:?}", config);
    EnclaveService::new(&config)
}

fn usage(text: &str) -> TeeError {
    TeeError::InvalidArgument(format!("usage: {}", text))
}

async fn cmd_init(service: &EnclaveService) -> TeeResult<()> {
    println!("\n  Generating Root CA inside the enclave...");
    let pem = service.init_root_ca().await?;
    let info = service.info().await?;
    println!("  Root CA created and sealed");
    println!("  Data dir:   {}", info.data_dir.display());
    println!("  MRENCLAVE:  {}", info.mr_enclave);
    println!("  MRSIGNER:   {}", info.mr_signer);
    println!("  Cert bytes: {}", pem.len());
    Ok(())
}

async fn cmd_status(service: &EnclaveService) -> TeeResult<()> {
    let info = service.info().await?;
    println!("\n  Enclave Status");
    println!("  {}", "=".repeat(40));
    println!("  Name:            {} v{}", info.name, info.version);
    println!("  MRENCLAVE:       {}", info.mr_enclave);
    println!("  MRSIGNER:        {}", info.mr_signer);
    println!("  TCB level:       {}", info.tcb_level);
    println!("  Data dir:        {}", info.data_dir.display());
    println!("  Root CA:         {}", if info.root_ca_initialized { "initialized" } else { "not initialized" });
    println!("  Sealed files:    {}", info.sealed_files.len());
    for name in &info.sealed_files {
        println!("    - {}", name);
    }
    println!(
        "  Trust policy:    {}",
        if info.policy_permissive { "permissive (empty allow-list)" } else { "enforced" }
    );
    println!("  Replay check:    {}", info.replay_protection);
    println!("  Quotes logged:   {}", info.quotes_logged);
    Ok(())
}

async fn cmd_cert(service: &EnclaveService) -> TeeResult<()> {
    print!("{}", service.root_certificate_pem().await?);
    Ok(())
}

async fn cmd_sign(service: &EnclaveService, args: &[String]) -> TeeResult<()> {
    if args.len() < 2 {
        return Err(usage("enclave sign <csr.pem> <type> [days]"));
    }
    let csr_pem = std::fs::read_to_string(&args[0])?;
    let cert_type: CertType = args[1].parse()?;
    let days = match args.get(2) {
        Some(d) => Some(
            d.parse::<u32>()
                .map_err(|_| TeeError::InvalidArgument(format!("invalid days '{}'", d)))?,
        ),
        None => None,
    };
    let pem = service.sign_certificate(&csr_pem, cert_type, days).await?;
    print!("{}", pem);
    Ok(())
}

async fn cmd_seal(service: &EnclaveService, args: &[String]) -> TeeResult<()> {
    if args.len() < 2 {
        return Err(usage("enclave seal <in> <out>"));
    }
    let plaintext = std::fs::read(&args[0])?;
    let len = plaintext.len();
    let sealed = service.seal(plaintext).await?;
    std::fs::write(&args[1], &sealed)?;
    println!("  Sealed {} bytes -> {} ({} bytes)", len, args[1], sealed.len());
    Ok(())
}

async fn cmd_unseal(service: &EnclaveService, args: &[String]) -> TeeResult<()> {
    if args.len() < 2 {
        return Err(usage("enclave unseal <in> <out>"));
    }
    let sealed = std::fs::read(&args[0])?;
    let plaintext = service.unseal(sealed).await?;
    std::fs::write(&args[1], &plaintext)?;
    println!("  Unsealed {} bytes -> {}", plaintext.len(), args[1]);
    Ok(())
}

async fn cmd_quote(service: &EnclaveService, args: &[String]) -> TeeResult<()> {
    let report_data = args.first().map(String::as_str).unwrap_or("enclave-cli");
    println!("{}", service.generate_quote(report_data.as_bytes().to_vec()).await?);
    Ok(())
}

async fn cmd_verify(service: &EnclaveService, args: &[String]) -> TeeResult<()> {
    let path = args.first().ok_or_else(|| usage("enclave verify <quote.json>"))?;
    let quote_json = std::fs::read_to_string(path)?;
    let result = service.verify_quote_result(&quote_json).await?;
    println!("{}", result.to_json()?);
    if !result.valid {
        process::exit(2);
    }
    Ok(())
}

async fn cmd_trust(service: &EnclaveService, args: &[String]) -> TeeResult<()> {
    let path = args.first().ok_or_else(|| usage("enclave trust <quote.json>"))?;
    let quote_json = std::fs::read_to_string(path)?;
    if service.trust_quote(&quote_json).await? {
        println!("  Measurements added to the trust policy");
    } else {
        println!("  Measurements already trusted");
    }
    Ok(())
}

async fn cmd_orderer_key(service: &EnclaveService, args: &[String]) -> TeeResult<()> {
    let chain = args.first().ok_or_else(|| usage("enclave orderer-key <chain>"))?;
    let public_pem = service.generate_orderer_key(chain).await?;
    println!("  Orderer key for chain '{}' generated and sealed", chain);
    print!("{}", public_pem);
    Ok(())
}

async fn cmd_orderer_import(service: &EnclaveService, args: &[String]) -> TeeResult<()> {
    if args.len() < 2 {
        return Err(usage("enclave orderer-import <chain> <key.pem>"));
    }
    let pkcs8_pem = std::fs::read_to_string(&args[1])?;
    let public_pem = service.import_orderer_key(&args[0], &pkcs8_pem).await?;
    println!("  Orderer key for chain '{}' imported and sealed", args[0]);
    print!("{}", public_pem);
    Ok(())
}

async fn cmd_sign_block(service: &EnclaveService, args: &[String]) -> TeeResult<()> {
    if args.len() < 2 {
        return Err(usage("enclave sign-block <chain> <file>"));
    }
    let block = std::fs::read(&args[1])?;
    let signature = service.sign_block(&args[0], block).await?;
    println!("{}", hex::encode(signature));
    Ok(())
}

async fn cmd_demo() -> TeeResult<()> {
    let mut config = EnclaveConfig::default();
    config.data_dir = env::temp_dir().join(format!("enclave-demo-{}", uuid::Uuid::new_v4()));
    config.root_ca_key_bits = 2048;
    let service = EnclaveService::new(&config)?;
    let outcome = run_demo(&service).await;
    let _ = std::fs::remove_dir_all(&config.data_dir);
    outcome
}

async fn run_demo(service: &EnclaveService) -> TeeResult<()> {
    println!("\n  [1/5] Root CA");
    service.init_root_ca().await?;
    let info = service.info().await?;
    println!("        MRENCLAVE {}", info.mr_enclave);

    println!("  [2/5] Orderer certificate for orderer0.hot-chain.com");
    let key = rcgen::KeyPair::generate()?;
    let mut params = rcgen::CertificateParams::new(vec!["orderer0.hot-chain.com".to_string()])?;
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "orderer0.hot-chain.com");
    let csr = params.serialize_request(&key)?.pem()?;
    let cert = service.sign_certificate(&csr, CertType::Orderer, None).await?;
    let issued = service.certificate_authority().verify_issued(&cert)?;
    println!("        issuer  {}", issued.issuer);
    println!("        subject {}", issued.subject);

    println!("  [3/5] Sealing");
    let sealed = service.seal(b"case-2024-001 evidence digest".to_vec()).await?;
    let opened = service.unseal(sealed.clone()).await?;
    println!("        {} bytes sealed, roundtrip ok: {}", sealed.len(), opened == b"case-2024-001 evidence digest");

    println!("  [4/5] Attestation");
    let quote = service.generate_quote(b"block-12345".to_vec()).await?;
    let result = service.verify_quote_result(&quote).await?;
    println!("        genuine quote valid: {}", result.valid);
    let mut forged: serde_json::Value = serde_json::from_str(&quote)?;
    forged["mr_enclave"] = serde_json::Value::String("00".repeat(32));
    let result = service.verify_quote_result(&forged.to_string()).await?;
    println!(
        "        forged quote valid:  {} ({})",
        result.valid,
        result
            .failure
            .map(|f: VerificationFailure| f.to_string())
            .unwrap_or_default()
    );

    println!("  [5/5] Orderer keys");
    for chain in ["hot", "cold"] {
        let public_pem = service.generate_orderer_key(chain).await?;
        let block = format!("{}-chain block #1", chain).into_bytes();
        let signature = service.sign_block(chain, block.clone()).await?;
        println!(
            "        {} chain signature verifies: {}",
            chain,
            verify_block_signature(&public_pem, &block, &signature)?
        );
    }

    println!("\n  Demo complete");
    Ok(())
}
