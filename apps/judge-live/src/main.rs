mod cli;

use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use live_bus::Subscription;
use live_client::chat::{ChatClient, ChatRole, ReplyEvent, StreamOutcome, FAILURE_NOTICE};
use live_client::reconcile::{MessageActivity, NotificationFeed};
use live_client::telemetry;
use live_client::{AuthSession, Channel, DomainEvent, JudgeEvent, LiveChannels};
use tracing::{debug, info};

use cli::{Cli, Command, WatchArgs};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    telemetry::init(&cli.logging.to_config()).context("failed to initialise logging")?;

    let config = cli.live_config();
    debug!(host = %config.endpoint.host, secure = config.endpoint.secure, "configuration loaded");
    let session = Arc::new(match &cli.uid {
        Some(uid) => AuthSession::signed_in(uid.as_str(), cli.token.clone()),
        None => AuthSession::new(),
    });

    match &cli.command {
        Command::Watch(args) => {
            if cli.uid.is_none() {
                bail!("watch needs a signed-in user; pass --uid or set JUDGE_LIVE_UID");
            }
            watch(&config, session, args).await
        }
        Command::Chat { message } => {
            let client = ChatClient::new(config.api_base()?, session);
            chat(&client, &message.join(" ")).await
        }
        Command::History => {
            let client = ChatClient::new(config.api_base()?, session);
            for turn in client.load_history().await? {
                let speaker = match turn.role {
                    ChatRole::User => "you",
                    ChatRole::Assistant => "ai",
                };
                println!("{speaker}> {}", turn.content);
            }
            Ok(())
        }
        Command::Clear => {
            let client = ChatClient::new(config.api_base()?, session);
            client.clear_history().await?;
            println!("chat history cleared");
            Ok(())
        }
    }
}

async fn watch(
    config: &live_client::LiveConfig,
    session: Arc<AuthSession>,
    args: &WatchArgs,
) -> Result<()> {
    let channels = LiveChannels::new(config, session);
    let feed = NotificationFeed::new();
    let activity = MessageActivity::new();
    let mut subscriptions: Vec<Subscription<DomainEvent>> = Vec::new();

    for channel in args.selected() {
        let supervisor = channels.get(channel);
        subscriptions.push(supervisor.subscribe(print_event));
        match channel {
            Channel::Notification => {
                subscriptions.push(feed.attach(supervisor));
            }
            Channel::Message => {
                subscriptions.push(activity.attach(supervisor));
            }
            Channel::Judge => {}
        }
        supervisor.follow_session();
        supervisor.start();
        info!(channel = %channel, "watching");
    }

    let mut unread = feed.watch_unread();
    let mut refreshes = activity.watch_refresh();
    let deadline = async {
        match args.duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = &mut deadline => break,
            Ok(()) = unread.changed() => {
                println!("notifications: {} unread", *unread.borrow_and_update());
            }
            Ok(()) = refreshes.changed() => {
                refreshes.borrow_and_update();
                println!("messages: new activity");
            }
        }
    }

    channels.stop_all();
    drop(subscriptions);
    Ok(())
}

fn print_event(event: &DomainEvent) {
    if event.channel == Channel::Judge {
        if let Ok(verdict) = event.decode::<JudgeEvent>() {
            let mut line = format!("[judge] {} {}", verdict.submission, verdict.status);
            if let (Some(time), Some(memory)) = (verdict.time, verdict.memory) {
                line.push_str(&format!(" {time}ms {memory}KB"));
            }
            println!("{line}");
            return;
        }
    }
    println!("[{}] {}", event.channel, event.payload);
}

async fn chat(client: &ChatClient, message: &str) -> Result<()> {
    let mut printed = 0usize;
    let mut sink = |event: ReplyEvent| match event {
        ReplyEvent::Text(text) => {
            if let Some(fresh) = text.get(printed..) {
                print!("{fresh}");
                let _ = std::io::stdout().flush();
            }
            printed = text.len();
        }
        ReplyEvent::Failed(reason) => {
            println!();
            eprintln!("{FAILURE_NOTICE} ({reason})");
        }
        ReplyEvent::Completed => println!(),
    };

    tokio::select! {
        outcome = client.stream_reply(message, &mut sink) => {
            if let StreamOutcome::Failed { partial, .. } = outcome {
                debug!(received = partial.len(), "reply ended early");
            }
            Ok(())
        }
        _ = tokio::signal::ctrl_c() => {
            println!();
            info!("reply abandoned");
            Ok(())
        }
    }
}
