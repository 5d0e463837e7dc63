use colored::*;
use serde_json::Value;
use std::time::Duration;

/// Terminal client for the bridge API served by `chatlink`
pub async fn run(args: Vec<String>) -> anyhow::Result<()> {
    let bin = args
        .first()
        .map(|s| s.as_str())
        .unwrap_or("cli")
        .to_string();

    if args.len() < 2 {
        print_usage(&bin);
        return Ok(());
    }

    let client = BridgeClient::new(bridge_url());
    let command = &args[1];

    match command.as_str() {
        "status" => show_status(&client).await?,
        "send" => {
            if args.len() < 4 {
                eprintln!("{}", format!("Usage: {} send <username> <message>", bin).yellow());
                return Ok(());
            }
            let message = args[3..].join(" ");
            send_message(&client, &args[2], &message).await?;
        }
        "conversation" | "conv" => {
            if args.len() < 3 {
                eprintln!("{}", format!("Usage: {} conversation <username>", bin).yellow());
                return Ok(());
            }
            show_conversation(&client, &args[2]).await?;
        }
        "history" => {
            if args.len() < 3 {
                eprintln!("{}", format!("Usage: {} history <username>", bin).yellow());
                return Ok(());
            }
            load_history(&client, &args[2]).await?;
        }
        "last" => {
            if args.len() < 3 {
                eprintln!("{}", format!("Usage: {} last <username>[,<username>...]", bin).yellow());
                return Ok(());
            }
            show_last_messages(&client, &args[2..].join(",")).await?;
        }
        "friends" => list_friends(&client).await?,
        "search" => {
            if args.len() < 3 {
                eprintln!("{}", format!("Usage: {} search <keyword>", bin).yellow());
                return Ok(());
            }
            search_users(&client, &args[2]).await?;
        }
        _ => {
            eprintln!("{} Unknown command: {}", "✗".red().bold(), command.red());
            print_usage(&bin);
        }
    }

    Ok(())
}

fn print_usage(bin: &str) {
    println!("{}", "⚡ ChatLink CLI".bright_cyan().bold());
    println!();
    println!("{}", "Usage:".bright_white().bold());
    println!("  {} <command> [args]", bin.cyan());
    println!();
    println!("{}", "Commands:".bright_white().bold());
    println!("  {}                          Show session status", "status".cyan());
    println!("  {} <username> <message>       Send a private message", "send".cyan());
    println!("  {} <username>         Show the conversation", "conversation".cyan());
    println!("  {} <username>              Load history from the server", "history".cyan());
    println!("  {} <username>[,...]           Newest message per peer", "last".cyan());
    println!("  {}                         List friends", "friends".cyan());
    println!("  {} <keyword>                Search users", "search".cyan());
}

fn bridge_url() -> String {
    if let Ok(url) = std::env::var("CHATLINK_BRIDGE_URL") {
        return url.trim_end_matches('/').to_string();
    }
    let port = std::env::var("CHATLINK_BRIDGE_PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(17082);
    format!("http://127.0.0.1:{}", port)
}

struct BridgeClient {
    base: String,
    http: reqwest::Client,
}

impl BridgeClient {
    fn new(base: String) -> Self {
        Self {
            base,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    async fn get(&self, path: &str) -> anyhow::Result<(u16, Value)> {
        let resp = self.http.get(format!("{}{}", self.base, path)).send().await;
        self.read(resp).await
    }

    async fn post(&self, path: &str, body: Value) -> anyhow::Result<(u16, Value)> {
        let resp = self
            .http
            .post(format!("{}{}", self.base, path))
            .json(&body)
            .send()
            .await;
        self.read(resp).await
    }

    async fn read(&self, resp: reqwest::Result<reqwest::Response>) -> anyhow::Result<(u16, Value)> {
        let resp = match resp {
            Ok(r) => r,
            Err(e) => {
                eprintln!("{}", "✗ Error: Could not reach the ChatLink bridge".red().bold());
                eprintln!("  Make sure `chatlink <username>` is running, or set:");
                eprintln!("  {} {}", "-".dimmed(), "CHATLINK_BRIDGE_PORT=17082".yellow());
                return Err(e.into());
            }
        };
        let status = resp.status().as_u16();
        let value = resp.json::<Value>().await.unwrap_or(Value::Null);
        Ok((status, value))
    }
}

fn fail(value: &Value) -> ! {
    let error = value["error"].as_str().unwrap_or("Unknown error");
    eprintln!("{} Error: {}", "✗".red().bold(), error.red());
    std::process::exit(1);
}

fn print_message(value: &Value, local: &str) {
    let sender = value["sender"].as_str().unwrap_or("?");
    let body = value["body"].as_str().unwrap_or("");
    let at = value["sentAt"].as_str().unwrap_or("");
    let who = if sender == local {
        sender.green().bold()
    } else {
        sender.cyan().bold()
    };
    println!("  {} {} {}", at.dimmed(), who, body);
}

async fn show_status(client: &BridgeClient) -> anyhow::Result<()> {
    let (status, data) = client.get("/api/status").await?;
    if status != 200 {
        fail(&data);
    }

    let state = data["connection"]["state"].as_str().unwrap_or("?");
    let state = match state {
        "connected" => state.green(),
        "connecting" => state.yellow(),
        _ => state.red(),
    };
    println!(
        "{}",
        "╭─ ChatLink Session ────────────────────────────────────────────╮".bright_cyan()
    );
    println!(
        "{} {}",
        "│".bright_cyan(),
        format!("User:       {}", data["username"].as_str().unwrap_or("?").cyan()).bright_white()
    );
    println!(
        "{} {}",
        "│".bright_cyan(),
        format!("Session:    {}", data["session_id"].as_str().unwrap_or("?").dimmed()).bright_white()
    );
    println!("{} {}", "│".bright_cyan(), format!("Connection: {}", state).bright_white());
    if let Some(reason) = data["connection"]["reason"].as_str() {
        println!("{} {}", "│".bright_cyan(), format!("Reason:     {}", reason.red()).bright_white());
    }
    println!(
        "{} {}",
        "│".bright_cyan(),
        format!("Messages:   {}", data["message_count"].as_u64().unwrap_or(0)).bright_white()
    );
    println!(
        "{}",
        "╰───────────────────────────────────────────────────────────────╯".bright_cyan()
    );
    Ok(())
}

async fn send_message(client: &BridgeClient, to: &str, message: &str) -> anyhow::Result<()> {
    let (status, data) = client
        .post("/api/send", serde_json::json!({ "to": to, "message": message }))
        .await?;
    match status {
        200 => println!("{} Message sent to {}", "✓".green().bold(), to.cyan()),
        503 => {
            println!(
                "{} Not connected; message kept locally for {}",
                "!".yellow().bold(),
                to.cyan()
            );
        }
        _ => fail(&data),
    }
    Ok(())
}

async fn show_conversation(client: &BridgeClient, peer: &str) -> anyhow::Result<()> {
    let (_, status_data) = client.get("/api/status").await?;
    let local = status_data["username"].as_str().unwrap_or("").to_string();

    let (status, data) = client
        .get(&format!("/api/conversations/{}", urlencoding::encode(peer)))
        .await?;
    if status != 200 {
        fail(&data);
    }
    let messages = data["messages"].as_array().cloned().unwrap_or_default();
    if messages.is_empty() {
        println!("{}", format!("No messages with {}", peer).yellow());
        return Ok(());
    }
    println!(
        "{}",
        format!("Conversation with {} ({})", peer, messages.len())
            .bright_cyan()
            .bold()
    );
    println!("{}", "─".repeat(60).dimmed());
    for m in &messages {
        print_message(m, &local);
    }
    Ok(())
}

async fn load_history(client: &BridgeClient, peer: &str) -> anyhow::Result<()> {
    let (status, data) = client
        .post(
            &format!("/api/history/{}", urlencoding::encode(peer)),
            Value::Null,
        )
        .await?;
    if status != 200 {
        fail(&data);
    }
    println!(
        "{} Loaded history with {}: {} new messages",
        "✓".green().bold(),
        peer.cyan(),
        data["stored"].as_u64().unwrap_or(0)
    );
    Ok(())
}

async fn show_last_messages(client: &BridgeClient, peers: &str) -> anyhow::Result<()> {
    let (_, status_data) = client.get("/api/status").await?;
    let local = status_data["username"].as_str().unwrap_or("").to_string();

    let (status, data) = client
        .get(&format!("/api/last-messages?peers={}", urlencoding::encode(peers)))
        .await?;
    if status != 200 {
        fail(&data);
    }
    let entries = data["last_messages"].as_array().cloned().unwrap_or_default();
    if entries.is_empty() {
        println!("{}", "No messages yet".yellow());
        return Ok(());
    }
    for entry in &entries {
        println!("{}", entry["peer"].as_str().unwrap_or("?").bright_white().bold());
        print_message(&entry["message"], &local);
    }
    Ok(())
}

async fn list_friends(client: &BridgeClient) -> anyhow::Result<()> {
    let (status, data) = client.get("/api/friends").await?;
    if status != 200 {
        fail(&data);
    }
    let friends = data["friends"].as_array().cloned().unwrap_or_default();
    if friends.is_empty() {
        println!("{}", "No friends found".yellow());
        return Ok(());
    }
    println!("{}", format!("Friends ({})", friends.len()).bright_cyan().bold());
    println!("{}", "─".repeat(60).dimmed());
    for f in &friends {
        let name = f["username"].as_str().unwrap_or("?").cyan();
        let first = f["firstName"].as_str().unwrap_or("");
        let seen = f["lastSeen"].as_str().unwrap_or("never");
        println!("  {} {} (last seen {})", name, first, seen.dimmed());
    }
    Ok(())
}

async fn search_users(client: &BridgeClient, keyword: &str) -> anyhow::Result<()> {
    let (status, data) = client
        .get(&format!("/api/users/search?q={}", urlencoding::encode(keyword)))
        .await?;
    if status != 200 {
        fail(&data);
    }
    let users = data["users"].as_array().cloned().unwrap_or_default();
    if users.is_empty() {
        println!("{}", format!("No users matching {}", keyword).yellow());
        return Ok(());
    }
    for u in &users {
        println!(
            "  {} {}",
            u["username"].as_str().unwrap_or("?").cyan(),
            format!("#{}", u["id"]).dimmed()
        );
    }
    Ok(())
}
