#![allow(clippy::expect_used, clippy::doc_markdown, clippy::uninlined_format_args)]
//! Example: Submit a message through a submission server
//!
//! Reads the message from a file (or stdin) and sends it to the given
//! recipients over STARTTLS on port 587.
//!
//! ## Running
//!
//! ```bash
//! SMTP_HOST=smtp.example.com SMTP_USER=me@example.com SMTP_PASSWORD=app-password \
//!     RUST_LOG=mailsubmit_smtp=trace \
//!     cargo run --package mailsubmit-smtp --example submit -- \
//!     me@example.com you@example.net < message.eml
//! ```
//!
//! If `SMTP_PASSWORD` is unset the password is asked for on the terminal,
//! and only if the server wants authentication.

use std::io::{self, Write};

use mailsubmit_smtp::{Address, Config, Credentials, Session, SubmissionRequest};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mailsubmit_smtp=debug,mailsubmit_sasl=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = std::env::args().skip(1);
    let sender = Address::new(args.next().expect("usage: submit <from> <to>..."))?;
    let recipients = args.map(Address::new).collect::<Result<Vec<_>, _>>()?;

    let host = std::env::var("SMTP_HOST").unwrap_or_else(|_| "localhost".to_string());
    let mut builder = Config::builder(&host);
    if let Ok(user) = std::env::var("SMTP_USER") {
        builder = match std::env::var("SMTP_PASSWORD") {
            Ok(password) => builder.credentials(user, password),
            Err(_) => builder.username(user),
        };
    }
    let config = builder.build();

    println!("Connecting to {}:{}...", config.host, config.port);
    let prompt = |username: Option<&str>| {
        print!("Password for {}: ", username.unwrap_or("(none)"));
        io::stdout().flush().ok()?;
        let mut password = String::new();
        io::stdin().read_line(&mut password).ok()?;
        Some(Credentials::new(username.unwrap_or_default(), password.trim()))
    };
    let mut session = Session::connect(config)
        .await?
        .with_credential_provider(Box::new(prompt));
    session.open().await?;
    println!(
        "✓ Ready (encrypted: {}, extensions: {})",
        session.is_encrypted(),
        session
            .capabilities()
            .iter()
            .map(|(k, _)| k)
            .collect::<Vec<_>>()
            .join(" ")
    );

    let mut request = SubmissionRequest::new(sender, tokio::io::stdin())
        .on_progress(|bytes| tracing::debug!(bytes, "message progress"));
    for recipient in recipients {
        request = request.to(recipient);
    }

    match session.submit(request).await {
        Ok(receipt) => {
            println!("✓ Accepted: {}", receipt.reply.message_text());
            for rejected in &receipt.rejected_recipients {
                println!("  ✗ {}: {}", rejected.recipient, rejected.message);
            }
        }
        Err(e) => println!("✗ Failed ({}): {}", e.kind(), e),
    }

    if session.is_ready() {
        session.quit().await?;
    }
    Ok(())
}
