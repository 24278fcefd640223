//! `folio status`: show the resolved configuration.

use folio_realtime::RealtimeConfig;

use super::args::ConnectionArgs;
use super::redact;

/// Handle the status command.
pub fn handle_status(args: &ConnectionArgs, config: &RealtimeConfig) {
    println!("Folio Status");
    println!("============");
    println!();

    match &args.config {
        Some(path) => println!("Config file: {}", path.display()),
        None => println!("Config file: (none)"),
    }
    println!("Server: {}", config.channel.server_url);
    println!("WebSocket URL: {}", config.channel.build_ws_url());
    println!("Token: {}", redact(args.token.as_deref()));
    println!();

    let user = &config.user;
    println!("User ID: {}", user.id);
    println!(
        "User name: {}",
        if user.name.is_empty() { "(not set)" } else { &user.name }
    );
    println!(
        "User email: {}",
        if user.email.is_empty() { "(not set)" } else { &user.email }
    );
    println!();

    let reconnect = &config.channel.reconnect;
    if reconnect.enabled {
        println!(
            "Reconnect: up to {} attempts, {:?} doubling to {:?}",
            reconnect.max_attempts, reconnect.base_delay, reconnect.max_delay
        );
    } else {
        println!("Reconnect: disabled");
    }
    println!("Keepalive: every {:?}", config.channel.ping_interval);
    println!("Cursor throttle: {:?}", config.throttle.interval);
    match config.presence.stale_after {
        Some(after) => println!(
            "Presence: stale after {:?}, swept every {:?}",
            after, config.presence.sweep_interval
        ),
        None => println!("Presence: entries kept until the user leaves"),
    }

    println!();
    if args.token.as_deref().is_none_or(str::is_empty) {
        println!("No token set. Pass --token or set FOLIO_TOKEN before watching a page:");
        println!("  folio watch --page <page-id>");
    } else {
        println!("Ready. Watch a page with:");
        println!("  folio watch --page <page-id>");
    }
}
