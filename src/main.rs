use presence_ledger::domain_model::*;
use presence_ledger::domain_port::*;
use presence_ledger::fields;
use presence_ledger::logger::*;
use presence_ledger::runtime::*;
use presence_ledger::settings::*;
use std::sync::Arc;
use std::time::Duration;

async fn print_presence(runtime: &Runtime, users: &[UserId]) -> anyhow::Result<()> {
    let now = Timestamp::now();
    for user in users {
        let label = match runtime.presence_service.presence_of(user).await? {
            Some(presence) => presence.label(now),
            None => "Offline".to_owned(),
        };
        info!(%user, state = ?runtime.presence_service.state(user), "{}", label);
    }
    Ok(())
}

async fn walkthrough(runtime: &Runtime, users: &[UserId]) -> anyhow::Result<()> {
    let [first, second, third, ..] = users else {
        return Err(anyhow::anyhow!("the walkthrough needs at least three users"));
    };

    for user in users {
        runtime
            .store
            .set(
                &DocumentPath::user(user),
                fields! { "username" => user.as_str() },
                SetMode::Merge,
            )
            .await?;
        runtime.sign_in(user).await?;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    print_presence(runtime, users).await?;

    let chats = &runtime.conversation_service;
    let receipts = &runtime.receipt_service;

    let message = chats.send_direct_message(first, second, "hello there").await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let report = receipts
        .on_conversation_opened(&message.chat_id, second, ConversationKind::Direct)
        .await?;
    info!(chat_id = %message.chat_id, ?report, "direct chat opened");

    let group = chats
        .create_group(first, "weekend", &[second.clone(), third.clone()])
        .await?;
    chats
        .send_group_message(&group.chat_id, third, "who brings snacks?")
        .await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let report = receipts
        .on_conversation_opened(&group.chat_id, second, ConversationKind::Group)
        .await?;
    info!(chat_id = %group.chat_id, ?report, "group chat opened");

    runtime.sign_out(third).await?;
    print_presence(runtime, users).await?;

    chats.delete_group(&group.chat_id).await?;
    info!(chat_id = %group.chat_id, "group deleted");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let logger = Logger::new_bootstrap();

    let project_settings = parse_settings(cli.settings.as_deref())?;
    info!(?project_settings);
    logger.reload_from_config(&LogConfig::from(&project_settings.log))?;

    let runtime = Arc::new(Runtime::try_new(&project_settings).await?);

    let users: Vec<UserId> = cli.users.iter().map(|u| UserId::new(u.as_str())).collect();
    if let Err(e) = walkthrough(&runtime, &users).await {
        error!("walkthrough failed: {:#}", e);
    }

    let shutdown_timeout = Duration::from_secs(project_settings.runtime.shutdown_timeout_secs);
    match tokio::time::timeout(shutdown_timeout, runtime.shutdown()).await {
        Ok(_) => info!("runtime shutdown successfully"),
        Err(_) => error!("runtime shutdown timed out"),
    }

    Ok(())
}
