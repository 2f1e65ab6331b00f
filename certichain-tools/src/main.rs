use std::{fmt, fs, path::PathBuf};

use anyhow::{bail, Context, Result};
use certichain_common::{
    assess, keccak_hex, read_record, recover_address, CheckResult, SigningWallet,
};
use clap::{Args, Parser, Subcommand};
use rand::RngCore;
use serde::Serialize;

#[derive(Parser)]
#[command(
    name = "certichain-tools",
    about = "Operator commands for CertiChain wallets and certificate records"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a fresh signing wallet.
    Keygen(OutputArgs),
    /// Sign a message with a private key (EIP-191 personal_sign).
    Sign(SignArgs),
    /// Recover the signer address of a message signature.
    Recover(RecoverArgs),
    /// Print the Keccak-256 hash of a canonical payload.
    HashPayload(PayloadArgs),
    /// Generate a random key for CERTICHAIN_VAULT_KEY.
    VaultKey,
    /// Re-run the integrity and signature checks on an exported certificate.
    CheckCertificate(CheckArgs),
}

#[derive(Args)]
struct OutputArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct SignArgs {
    /// Hex private key, with or without `0x`.
    #[arg(long)]
    private_key: String,
    #[command(flatten)]
    message: PayloadArgs,
}

#[derive(Args)]
struct RecoverArgs {
    #[arg(long)]
    signature: String,
    #[command(flatten)]
    message: PayloadArgs,
}

#[derive(Args)]
struct PayloadArgs {
    /// Message text. Mutually exclusive with `--file`.
    #[arg(long, conflicts_with = "file")]
    message: Option<String>,
    /// Read the message from a file instead.
    #[arg(long)]
    file: Option<PathBuf>,
}

impl PayloadArgs {
    fn bytes(&self) -> Result<Vec<u8>> {
        match (&self.message, &self.file) {
            (Some(message), None) => Ok(message.as_bytes().to_vec()),
            (None, Some(path)) => {
                fs::read(path).with_context(|| format!("failed to read {}", path.display()))
            }
            _ => bail!("pass exactly one of --message or --file"),
        }
    }
}

#[derive(Args)]
struct CheckArgs {
    /// Certificate record exported as JSON.
    #[arg(long)]
    record: PathBuf,
    /// Wallet the claimant is known to own, as `chain:address` or a bare address.
    #[arg(long)]
    owner_wallet: Option<String>,
    /// Treat the issuer as deactivated.
    #[arg(long)]
    issuer_inactive: bool,
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Keygen(args) => keygen(args),
        Commands::Sign(args) => sign(args),
        Commands::Recover(args) => recover(args),
        Commands::HashPayload(args) => hash_payload(args),
        Commands::VaultKey => vault_key(),
        Commands::CheckCertificate(args) => check_certificate(args),
    }
}

fn keygen(args: OutputArgs) -> Result<()> {
    let wallet = SigningWallet::generate();
    let summary = KeygenSummary {
        address: wallet.address(),
        private_key: wallet.private_key_hex(),
    };
    output_summary(&summary, args.json)
}

fn sign(args: SignArgs) -> Result<()> {
    let wallet = SigningWallet::from_private_key_hex(&args.private_key)
        .context("invalid private key")?;
    let message = args.message.bytes()?;
    let signature = wallet.sign_message(&message)?;
    println!("{signature}");
    Ok(())
}

fn recover(args: RecoverArgs) -> Result<()> {
    let message = args.message.bytes()?;
    let address = recover_address(&message, &args.signature)
        .context("signature does not recover to an address")?;
    println!("{address}");
    Ok(())
}

fn hash_payload(args: PayloadArgs) -> Result<()> {
    println!("{}", keccak_hex(&args.bytes()?));
    Ok(())
}

fn vault_key() -> Result<()> {
    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    println!("{}", hex::encode(key));
    Ok(())
}

fn check_certificate(args: CheckArgs) -> Result<()> {
    let record = read_record(&args.record)
        .with_context(|| format!("failed to load {}", args.record.display()))?;
    let assessment = assess(&record, !args.issuer_inactive, args.owner_wallet.as_deref());
    let summary = CheckSummary {
        certificate_id: record.certificate_id,
        verified: assessment.verified,
        trust_score: assessment.trust_score,
        data_integrity: assessment.data_integrity,
        issuer_signature: assessment.issuer_signature,
        blockchain_nft: assessment.blockchain_nft,
        receiver_ownership: assessment.receiver_ownership,
    };
    output_summary(&summary, args.json)?;
    if !summary.verified {
        bail!("certificate {} failed verification", summary.certificate_id);
    }
    Ok(())
}

fn output_summary<T>(summary: &T, json: bool) -> Result<()>
where
    T: Serialize + fmt::Display,
{
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
    } else {
        println!("{}", summary);
    }
    Ok(())
}

#[derive(Serialize)]
struct KeygenSummary {
    address: String,
    private_key: String,
}

impl fmt::Display for KeygenSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "address: {}", self.address)?;
        writeln!(f, "private_key: {}", self.private_key)
    }
}

#[derive(Serialize)]
struct CheckSummary {
    certificate_id: String,
    verified: bool,
    trust_score: u8,
    data_integrity: CheckResult,
    issuer_signature: CheckResult,
    blockchain_nft: CheckResult,
    receiver_ownership: CheckResult,
}

impl fmt::Display for CheckSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "certificate: {}", self.certificate_id)?;
        writeln!(f, "verified: {}", self.verified)?;
        writeln!(f, "trust_score: {}/100", self.trust_score)?;
        for (name, check) in [
            ("data integrity", &self.data_integrity),
            ("issuer signature", &self.issuer_signature),
            ("blockchain nft", &self.blockchain_nft),
            ("receiver ownership", &self.receiver_ownership),
        ] {
            writeln!(f, "{name}: {:?} ({} pts) {}", check.status, check.points(), check.message)?;
        }
        Ok(())
    }
}
