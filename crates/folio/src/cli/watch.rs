//! `folio watch`: open a page and print its live presence.

use folio_realtime::{
    ConnectionStatus, Cursor, EventChannel, PresenceEntry, RealtimeConfig, SessionCache,
};

use super::CliError;
use super::args::ConnectionArgs;

/// Handle the watch command - stay on a page until Ctrl+C.
pub fn handle_watch(
    args: &ConnectionArgs,
    config: RealtimeConfig,
    page_id: &str,
    cursor: Option<Cursor>,
) -> Result<(), CliError> {
    let Some(token) = args.token.as_deref().filter(|t| !t.is_empty()) else {
        return Err(CliError::Config(
            "No token set. Pass --token or set FOLIO_TOKEN.".to_string(),
        ));
    };

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let channel = EventChannel::native(config.channel.clone());
        let cache = SessionCache::new(channel.clone(), config.clone());

        println!("Server: {}", config.channel.build_ws_url());
        println!("Page: {}", page_id);
        println!("User: {} ({})", config.user.name, config.user.id);
        println!();

        let session = cache.get(page_id);
        let local_id = config.user.id.clone();
        session.observe_presence(move |entries| print_presence(&local_id, &entries));

        let mut status = channel.subscribe_status();
        tracing::info!("Opening page {} as {}", page_id, config.user.id);
        channel.connect(Some(token));

        if let Some(cursor) = cursor {
            session.submit_cursor(cursor)?;
        }

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                result = &mut ctrl_c => {
                    if let Err(e) = result {
                        eprintln!("Failed to listen for Ctrl+C: {}", e);
                    }
                    println!("\nShutting down...");
                    break;
                }
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = status.borrow_and_update().clone();
                    print_status(&current);
                }
            }
        }

        // Leave rooms while the connection is still up, then tear down sessions.
        tracing::info!("Disconnecting ({} message(s) still queued)", channel.pending_len());
        channel.disconnect().await;
        drop(session);
        cache.shutdown();
        Ok::<(), CliError>(())
    })?;

    println!("Stopped.");
    Ok(())
}

fn print_status(status: &ConnectionStatus) {
    match status {
        ConnectionStatus::Disconnected => println!("[status] disconnected"),
        ConnectionStatus::Connecting => println!("[status] connecting..."),
        ConnectionStatus::Connected => println!("[status] connected"),
        ConnectionStatus::Reconnecting { attempt } => {
            println!("[status] reconnecting (attempt {})", attempt)
        }
        ConnectionStatus::Exhausted { attempts } => {
            tracing::warn!("Reconnect attempts exhausted after {}", attempts);
            eprintln!(
                "[status] gave up after {} reconnect attempts; edits are queued until restart",
                attempts
            )
        }
    }
}

fn print_presence(local_id: &str, entries: &[PresenceEntry]) {
    println!("[presence] {} user(s) on page", entries.len());
    for entry in entries {
        let name = if entry.user_name.is_empty() {
            entry.user_id.as_str()
        } else {
            entry.user_name.as_str()
        };
        let you = if entry.user_id == local_id { " (you)" } else { "" };
        match &entry.cursor {
            Some(c) => println!("  {}{} at ({}, {})", name, you, c.x, c.y),
            None => println!("  {}{}", name, you),
        }
    }
}
