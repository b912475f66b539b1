//! # CLI Execution Functions
//!
//! Execution logic for each subcommand, kept out of `main.rs`.

use anyhow::{bail, Context, Result};
use std::path::Path;
use svmontaj::config::{Config, ConfigArgs};
use svmontaj::db::users::{NewUser, UserRole, UserStatus};
use svmontaj::db::Database;
use svmontaj::tariff::{TariffTable, TariffView};
use svmontaj::{auth, payments, server, sms};
use tracing::info;

use super::Cli;

fn database_url(cli: &Cli) -> Result<&str> {
    cli.database_url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is required (set via --database-url or env)"))
}

async fn connect(cli: &Cli) -> Result<Database> {
    let db = Database::connect(database_url(cli)?)
        .await
        .context("failed to connect to database")?;
    db.migrate().await.context("failed to run migrations")?;
    Ok(db)
}

pub fn run_serve(
    cli: &Cli,
    port: u16,
    static_dir: Option<&Path>,
    args: &ConfigArgs,
) -> Result<()> {
    let config = Config::from_args(args)?;
    let sms = sms::from_settings(&config.sms)?;
    let gateway = payments::from_settings(&config.gateway)?;
    info!(
        sms = ?config.sms.provider,
        gateway = ?config.gateway.kind,
        "svmontaj starting"
    );
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let db = connect(cli).await?;
        let state = server::AppState::new(db, config, sms, gateway);
        server::run(port, state, static_dir).await
    })
}

pub fn run_migrate(cli: &Cli) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(connect(cli))?;
    info!("migrations applied");
    Ok(())
}

pub fn run_create_admin(cli: &Cli, phone: &str, password: &str, name: &str) -> Result<()> {
    let Some(phone) = auth::normalize_phone(phone) else {
        bail!("invalid phone number: {}", phone);
    };
    auth::validate_password(password).map_err(anyhow::Error::msg)?;
    let name = name.trim();
    if name.is_empty() {
        bail!("name must not be empty");
    }
    let password_hash = auth::hash_password(password)?;

    let rt = tokio::runtime::Runtime::new()?;
    let user = rt.block_on(async {
        let db = connect(cli).await?;
        db.create_user(&NewUser {
            phone: &phone,
            password_hash: &password_hash,
            name,
            role: UserRole::Admin,
            status: UserStatus::Active,
            phone_verified: true,
            bonus_balance: 0,
        })
        .await
    })?;
    match user {
        Some(user) => {
            info!(user_id = %user.id, phone = %user.phone, "admin created");
            println!("{}", user.id);
            Ok(())
        }
        None => bail!("a user with phone {} already exists", phone),
    }
}

pub fn run_tariffs(tariffs_file: Option<&Path>, json: bool) -> Result<()> {
    let table = match tariffs_file {
        Some(path) => TariffTable::load(path)?,
        None => TariffTable::default(),
    };
    let views = table.views();
    if json {
        println!("{}", serde_json::to_string_pretty(&views)?);
    } else {
        print!("{}", render_table(&views));
    }
    Ok(())
}

fn render_table(views: &[TariffView]) -> String {
    let mut out = format!(
        "{:<10} {:<12} {:>8} {:>6} {:>14} {:>16}\n",
        "TARIFF", "TITLE", "PRICE", "DAYS", "RESPONSE_COST", "SPECIALIZATIONS"
    );
    for v in views {
        out.push_str(&format!(
            "{:<10} {:<12} {:>8} {:>6} {:>14} {:>16}\n",
            v.tariff.to_string(),
            v.title,
            v.price,
            v.period_days,
            v.response_cost,
            v.max_specializations
        ));
    }
    out
}
