use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clima_core::{Config, HttpResponse, Pipeline};
use inquire::{Password, PasswordDisplayMode, Text};
use std::{fs, path::PathBuf};

/// Top-level CLI struct.
#[derive(Debug, Parser)]
#[command(name = "clima", version, about = "Weather lookup pipeline")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Store the OpenWeather API key and preferences.
    Configure,

    /// Resolve one city directly and print the response.
    Resolve {
        city: String,

        /// Use the canned weather table (requires `worker.allow_simulation`).
        #[arg(long)]
        mock: bool,
    },

    /// Run a raw event file: a single work item or a `Records` batch envelope.
    Process { event: PathBuf },

    /// Submit a city to the work queue through the intake.
    Enqueue { city: String },

    /// Process everything waiting on the work queue as one batch.
    Drain,

    /// Show the stored record for a city.
    Show { city: String },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Configure => configure()?,
            Command::Resolve { city, mock } => {
                print_response(&open_pipeline()?.resolve(&city, mock).await);
            }
            Command::Process { event } => {
                let text = fs::read_to_string(&event).with_context(|| {
                    format!("Failed to read event file: {}", event.display())
                })?;
                let value = serde_json::from_str(&text)
                    .with_context(|| format!("Event file is not JSON: {}", event.display()))?;

                match open_pipeline()?.process_event(&value).await {
                    Some(response) => print_response(&response),
                    None => println!("Batch processed."),
                }
            }
            Command::Enqueue { city } => print_response(&open_pipeline()?.enqueue(&city).await),
            Command::Drain => {
                let count = open_pipeline()?.drain_work_queue().await?;
                println!("Processed {count} queued item(s).");
            }
            Command::Show { city } => match open_pipeline()?.lookup_stored(&city).await? {
                Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                None => println!("No record stored for {city}."),
            },
        }

        Ok(())
    }
}

fn open_pipeline() -> Result<Pipeline> {
    let config = Config::load()?;
    Pipeline::open(&config)
}

fn configure() -> Result<()> {
    let mut config = Config::load()?;

    let api_key = Password::new("OpenWeather API key:")
        .with_display_mode(PasswordDisplayMode::Masked)
        .without_confirmation()
        .prompt()
        .context("API key prompt aborted")?;

    let lang = Text::new("Response language:")
        .with_default(&config.provider.lang)
        .prompt()
        .context("Language prompt aborted")?;

    config.set_api_key(api_key);
    config.provider.lang = lang;
    config.save()?;

    println!("Configuration saved to {}", Config::config_file_path()?.display());
    Ok(())
}

fn print_response(response: &HttpResponse) {
    println!("{}", response.status_code);
    match response.body_json() {
        Ok(body) => println!("{body:#}"),
        Err(_) => println!("{}", response.body),
    }
}
