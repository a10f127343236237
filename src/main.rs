//! Operator command line for the dispenser gateway.
//!
//! ```text
//! pos-dispenser [--catalog <file.json>] <command>
//!
//!   status                 middleware and serial-link health
//!   config                 show the stored gateway settings
//!   set-url <url>          store the middleware URL
//!   drinks                 dispenser drinks of the loaded catalog
//!   ingredients <id>       resolved ingredients of a cocktail
//!   ledger <session>       credit log of a session
//!   send <plu> [qty]       manual credit on the configured server number
//! ```

use anyhow::{anyhow, bail, Context, Result};
use std::sync::Arc;
use tracing::info;

use pos_dispenser::{
    db, logging, ActorContext, DispenseService, GatewayConfig, HttpGateway, MemoryCatalog,
    RawCreditRequest,
};

const OPERATOR_REF: &str = "operator-cli";

fn usage() -> &'static str {
    "usage: pos-dispenser [--catalog <file.json>] \
     <status|config|set-url <url>|drinks|ingredients <id>|ledger <session>|send <plu> [qty]>"
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let catalog_path = match args.iter().position(|a| a == "--catalog") {
        Some(i) => {
            if i + 1 >= args.len() {
                bail!("--catalog needs a file path");
            }
            let path = args.remove(i + 1);
            args.remove(i);
            Some(path)
        }
        None => None,
    };
    let Some(command) = args.first().cloned() else {
        bail!(usage());
    };

    let data_dir = logging::data_dir();
    let _guard = logging::init(&logging::log_dir(&data_dir));

    let db = Arc::new(db::init(&data_dir).map_err(|e| anyhow!(e))?);
    let config = {
        let conn = db
            .conn
            .lock()
            .map_err(|_| anyhow!("database lock poisoned"))?;
        GatewayConfig::load(&conn)?
    };

    let catalog = match &catalog_path {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading catalog {path}"))?;
            MemoryCatalog::from_json(&json).with_context(|| format!("parsing catalog {path}"))?
        }
        None => MemoryCatalog::new(),
    };

    let gateway = Arc::new(HttpGateway::new(&config)?);
    let service = DispenseService::new(&config, gateway, Arc::new(catalog), db.clone());
    info!(command = %command, url = %config.base_url, "running command");

    match command.as_str() {
        "status" => {
            let health = service.check_gateway_status().await;
            println!("{}", serde_json::to_string_pretty(&health)?);
        }
        "config" => {
            println!("url:          {}", config.base_url);
            println!("server_no:    {}", config.server_no);
            println!("serial_port:  {}", config.serial_port);
            println!("baudrate:     {}", config.baudrate);
            println!("token:        {}", if config.token.is_some() { "set" } else { "none" });
            println!("placeholders: {}", config.allow_placeholder_ingredients);
        }
        "set-url" => {
            let url = args.get(1).ok_or_else(|| anyhow!(usage()))?;
            let updated = GatewayConfig {
                base_url: GatewayConfig::with_url(url)?.base_url,
                ..config
            };
            let conn = db
                .conn
                .lock()
                .map_err(|_| anyhow!("database lock poisoned"))?;
            updated.save(&conn)?;
            println!("middleware url set to {}", updated.base_url);
        }
        "drinks" => {
            for drink in service.available_drinks() {
                let plu = drink.plu_code.as_deref().unwrap_or("-");
                let kind = if drink.is_cocktail { "cocktail" } else { "simple" };
                println!("{:>6}  {:<10} {:<8} {}", drink.id, plu, kind, drink.name);
            }
        }
        "ingredients" => {
            let id: i64 = args
                .get(1)
                .ok_or_else(|| anyhow!(usage()))?
                .parse()
                .context("product id must be a number")?;
            let resolution = service.cocktail_ingredients(id)?;
            println!("{}", serde_json::to_string_pretty(&resolution)?);
        }
        "ledger" => {
            let session = args.get(1).ok_or_else(|| anyhow!(usage()))?;
            let entries = service.ledger().entries_for_session(session)?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        "send" => {
            let plu_code = args.get(1).ok_or_else(|| anyhow!(usage()))?.clone();
            let quantity = match args.get(2) {
                Some(q) => q.parse().context("quantity must be a positive number")?,
                None => 1,
            };
            let actor = ActorContext::barman(OPERATOR_REF, config.server_no);
            let outcome = service
                .send_raw_credit(
                    &RawCreditRequest {
                        plu_code,
                        quantity,
                        product_name: String::new(),
                        session_ref: OPERATOR_REF.to_string(),
                        order_line_ref: None,
                    },
                    &actor,
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.success {
                bail!("credit not sent: {}", outcome.message);
            }
        }
        other => bail!("unknown command {other:?}\n{}", usage()),
    }
    Ok(())
}
