//! Chat command dispatch.
//!
//! Commands are looked up by their lowercased, trimmed name. Each handler
//! gets the shared context plus the invoking user's snapshot and replies
//! through the message sender. Registration stays open so new commands can
//! be added next to the built-ins.

use crate::notify::{MessageSender, SendError};
use crate::users::{User, UserDirectory};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_PREFIX: &str = "!";

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("reply failed: {0}")]
    Reply(#[from] SendError),
}

/// Inclusive bounds accepted by `sell` and `buy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceLimits {
    pub min: i64,
    pub max: i64,
}

impl PriceLimits {
    pub fn contains(&self, price: i64) -> bool {
        price >= self.min && price <= self.max
    }
}

pub struct CommandContext<'a> {
    pub users: &'a UserDirectory,
    pub commands: &'a CommandRegistry,
    pub limits: PriceLimits,
}

pub struct CommandInput {
    pub name: String,
    pub args: String,
    pub user: User,
    pub sender: Arc<dyn MessageSender>,
}

impl CommandInput {
    /// Reply to the invoking user.
    pub async fn reply(&self, text: &str) -> Result<(), CommandError> {
        self.sender.send_direct(&self.user.id, text).await?;
        Ok(())
    }
}

#[async_trait]
pub trait ChatCommand: Send + Sync {
    async fn run(&self, ctx: &CommandContext<'_>, input: CommandInput) -> Result<(), CommandError>;
}

pub fn format_command_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Split `"!sell  400"` into `("sell", "400")`. Returns `None` when the
/// text does not start with `prefix` directly followed by a command name.
pub fn parse_command(text: &str, prefix: &str) -> Option<(String, String)> {
    let rest = text.trim_start().strip_prefix(prefix)?;
    if rest.starts_with(char::is_whitespace) {
        return None;
    }

    let mut fields = rest.split_whitespace();
    let name = fields.next()?;
    let args = fields.collect::<Vec<_>>().join(" ");
    Some((name.to_string(), args))
}

#[derive(Clone, Default)]
pub struct CommandRegistry {
    commands: Arc<DashMap<String, Arc<dyn ChatCommand>>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register_defaults();
        registry
    }

    pub fn add_command(&self, name: &str, command: Arc<dyn ChatCommand>) {
        self.commands.insert(format_command_name(name), command);
    }

    pub fn register_defaults(&self) {
        self.add_command("help", Arc::new(HelpCommand));
        self.add_command("echo", Arc::new(EchoCommand));
        self.add_command("sell", Arc::new(SellCommand));
        self.add_command("buy", Arc::new(BuyCommand));
        self.add_command("maxqueue", Arc::new(MaxQueueCommand));
        self.add_command("stop", Arc::new(StopCommand));
        self.add_command("status", Arc::new(StatusCommand));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ChatCommand>> {
        self.commands
            .get(&format_command_name(name))
            .map(|entry| entry.value().clone())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.commands.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Run the named command. Returns `Ok(false)` when no command is
    /// registered under that name.
    pub async fn dispatch(
        &self,
        users: &UserDirectory,
        limits: PriceLimits,
        input: CommandInput,
    ) -> Result<bool, CommandError> {
        let Some(command) = self.get(&input.name) else {
            debug!(command = %input.name, user = %input.user.id, "unknown command");
            return Ok(false);
        };

        let ctx = CommandContext {
            users,
            commands: self,
            limits,
        };
        command.run(&ctx, input).await?;
        Ok(true)
    }
}

/// Apply `f` to the stored user, falling back to the snapshot when the
/// directory has no entry for it yet.
fn persist<F>(users: &UserDirectory, user: &User, f: F) -> User
where
    F: Fn(&mut User),
{
    match users.update(&user.id, &f) {
        Ok(updated) => updated,
        Err(_) => {
            let mut updated = user.clone();
            f(&mut updated);
            users.put(updated.clone());
            updated
        }
    }
}

pub struct HelpCommand;

#[async_trait]
impl ChatCommand for HelpCommand {
    async fn run(&self, ctx: &CommandContext<'_>, input: CommandInput) -> Result<(), CommandError> {
        let names = ctx.commands.names();
        input
            .reply(&format!("Commands: {}", names.join(", ")))
            .await
    }
}

pub struct EchoCommand;

#[async_trait]
impl ChatCommand for EchoCommand {
    async fn run(&self, _ctx: &CommandContext<'_>, input: CommandInput) -> Result<(), CommandError> {
        input.reply(&input.args).await
    }
}

pub struct SellCommand;

#[async_trait]
impl ChatCommand for SellCommand {
    async fn run(&self, ctx: &CommandContext<'_>, input: CommandInput) -> Result<(), CommandError> {
        let Ok(price) = input.args.trim().parse::<i64>() else {
            return input.reply("Usage: !sell [minPrice]").await;
        };
        if !ctx.limits.contains(price) {
            return input
                .reply(&format!(
                    "Sell price must be between {} and {}",
                    ctx.limits.min, ctx.limits.max
                ))
                .await;
        }

        persist(ctx.users, &input.user, |u| {
            u.sell_price = price;
            u.polling = true;
        });
        debug!(user = %input.user.id, price, "sell price set");

        input
            .reply(&format!(
                "I will notify you about islands buying turnips above {}",
                price
            ))
            .await
    }
}

pub struct BuyCommand;

#[async_trait]
impl ChatCommand for BuyCommand {
    async fn run(&self, ctx: &CommandContext<'_>, input: CommandInput) -> Result<(), CommandError> {
        let Ok(price) = input.args.trim().parse::<i64>() else {
            return input.reply("Usage: !buy [maxPrice]").await;
        };
        if !ctx.limits.contains(price) {
            return input
                .reply(&format!(
                    "Buy price must be between {} and {}",
                    ctx.limits.min, ctx.limits.max
                ))
                .await;
        }

        persist(ctx.users, &input.user, |u| {
            u.buy_price = price;
            u.polling = true;
        });
        debug!(user = %input.user.id, price, "buy price set");

        input
            .reply(&format!(
                "I will notify you about islands selling turnips below {}",
                price
            ))
            .await
    }
}

pub struct MaxQueueCommand;

#[async_trait]
impl ChatCommand for MaxQueueCommand {
    async fn run(&self, ctx: &CommandContext<'_>, input: CommandInput) -> Result<(), CommandError> {
        let Ok(max_in_queue) = input.args.trim().parse::<i64>() else {
            return input.reply("Usage: !maxqueue [maxUsersInQueue]").await;
        };

        persist(ctx.users, &input.user, |u| u.max_in_queue = max_in_queue);

        input
            .reply(&format!(
                "I will only send items that have {} users in the queue or less",
                max_in_queue
            ))
            .await
    }
}

pub struct StopCommand;

#[async_trait]
impl ChatCommand for StopCommand {
    async fn run(&self, ctx: &CommandContext<'_>, input: CommandInput) -> Result<(), CommandError> {
        persist(ctx.users, &input.user, |u| u.polling = false);
        input.reply("You have stopped looking for an island.").await
    }
}

pub struct StatusCommand;

pub fn status_message(user: &User) -> String {
    if !user.polling {
        return "You are not currently looking for islands".to_string();
    }

    let mut msg = "You are currently looking for islands".to_string();
    if user.sell_price > 0 {
        msg.push_str(&format!(" with a turnip price over {}", user.sell_price));
    } else if user.buy_price > 0 {
        msg.push_str(&format!(" with a turnip price under {}", user.buy_price));
    }
    msg
}

#[async_trait]
impl ChatCommand for StatusCommand {
    async fn run(&self, ctx: &CommandContext<'_>, input: CommandInput) -> Result<(), CommandError> {
        // Prefer the stored entry; the snapshot may predate a concurrent update.
        let user = ctx.users.get(&input.user.id).unwrap_or_else(|_| input.user.clone());
        input.reply(&status_message(&user)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::tests::RecordingSender;

    const LIMITS: PriceLimits = PriceLimits { min: 15, max: 800 };

    struct Harness {
        users: UserDirectory,
        registry: CommandRegistry,
        sender: Arc<RecordingSender>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                users: UserDirectory::new(),
                registry: CommandRegistry::with_defaults(),
                sender: Arc::new(RecordingSender::default()),
            }
        }

        async fn run(&self, user: &User, name: &str, args: &str) -> Result<bool, CommandError> {
            let input = CommandInput {
                name: name.to_string(),
                args: args.to_string(),
                user: user.clone(),
                sender: self.sender.clone(),
            };
            self.registry.dispatch(&self.users, LIMITS, input).await
        }

        fn replies(&self) -> Vec<String> {
            self.sender.messages().into_iter().map(|(_, text)| text).collect()
        }
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(
            parse_command("!sell 400", "!"),
            Some(("sell".to_string(), "400".to_string()))
        );
        assert_eq!(
            parse_command("!echo  foo   bar ", "!"),
            Some(("echo".to_string(), "foo bar".to_string()))
        );
        assert_eq!(
            parse_command("!status", "!"),
            Some(("status".to_string(), String::new()))
        );
        assert_eq!(parse_command("sell 400", "!"), None);
        assert_eq!(parse_command("! sell", "!"), None);
        assert_eq!(parse_command("!", "!"), None);
    }

    #[test]
    fn test_command_names_are_normalized() {
        let registry = CommandRegistry::with_defaults();
        assert!(registry.get(" SELL ").is_some());
        assert!(registry.get("Status").is_some());
        assert!(registry.get("dance").is_none());
    }

    #[tokio::test]
    async fn test_unknown_command_is_not_handled() {
        let h = Harness::new();
        let user = h.users.create_default("u1");

        assert!(!h.run(&user, "dance", "").await.unwrap());
        assert!(h.replies().is_empty());
    }

    #[tokio::test]
    async fn test_help_lists_commands() {
        let h = Harness::new();
        let user = h.users.create_default("u1");
        h.run(&user, "help", "").await.unwrap();

        assert_eq!(
            h.replies(),
            vec!["Commands: buy, echo, help, maxqueue, sell, status, stop".to_string()]
        );
    }

    #[tokio::test]
    async fn test_echo_replies_verbatim() {
        let h = Harness::new();
        let user = h.users.create_default("u1");
        h.run(&user, "echo", "foo bar").await.unwrap();

        assert_eq!(h.replies(), vec!["foo bar".to_string()]);
    }

    #[tokio::test]
    async fn test_echo_propagates_reply_failure() {
        let mut h = Harness::new();
        h.sender = Arc::new(RecordingSender::failing(1));
        let user = h.users.create_default("u1");

        let result = h.run(&user, "echo", "[error] failed").await;
        assert!(matches!(result, Err(CommandError::Reply(_))));
        assert!(h.replies().is_empty());
    }

    #[tokio::test]
    async fn test_sell_sets_price_and_polling() {
        let h = Harness::new();
        let user = h.users.create_default("u1");
        h.run(&user, "sell", "400").await.unwrap();

        let stored = h.users.get("u1").unwrap();
        assert_eq!(stored.sell_price, 400);
        assert!(stored.polling);
        assert!(h.replies()[0].contains("above 400"));
    }

    #[tokio::test]
    async fn test_sell_rejects_bad_input_without_mutation() {
        for args in ["", "abc", "4OO"] {
            let h = Harness::new();
            let user = h.users.create_default("u1");
            h.run(&user, "sell", args).await.unwrap();

            assert_eq!(h.users.get("u1").unwrap(), user);
            assert_eq!(h.replies(), vec!["Usage: !sell [minPrice]".to_string()]);
        }
    }

    #[tokio::test]
    async fn test_sell_rejects_out_of_range_without_mutation() {
        for args in ["14", "801"] {
            let h = Harness::new();
            let user = h.users.create_default("u1");
            h.run(&user, "sell", args).await.unwrap();

            assert_eq!(h.users.get("u1").unwrap(), user);
            assert_eq!(
                h.replies(),
                vec!["Sell price must be between 15 and 800".to_string()]
            );
        }
    }

    #[tokio::test]
    async fn test_buy_sets_price_and_keeps_sell() {
        let h = Harness::new();
        let user = h.users.create_default("u1");
        h.run(&user, "sell", "500").await.unwrap();
        h.run(&user, "buy", "90").await.unwrap();

        let stored = h.users.get("u1").unwrap();
        assert_eq!(stored.buy_price, 90);
        assert_eq!(stored.sell_price, 500);
        assert!(stored.polling);
        assert!(h.replies()[1].contains("below 90"));
    }

    #[tokio::test]
    async fn test_buy_rejects_bad_input() {
        let h = Harness::new();
        let user = h.users.create_default("u1");
        h.run(&user, "buy", "cheap").await.unwrap();
        h.run(&user, "buy", "1000").await.unwrap();

        assert_eq!(h.users.get("u1").unwrap(), user);
        assert_eq!(
            h.replies(),
            vec![
                "Usage: !buy [maxPrice]".to_string(),
                "Buy price must be between 15 and 800".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_maxqueue() {
        let h = Harness::new();
        let user = h.users.create_default("u1");
        h.run(&user, "maxqueue", "5").await.unwrap();
        h.run(&user, "maxqueue", "lots").await.unwrap();

        let stored = h.users.get("u1").unwrap();
        assert_eq!(stored.max_in_queue, 5);
        assert!(!stored.polling);
        assert_eq!(
            h.replies(),
            vec![
                "I will only send items that have 5 users in the queue or less".to_string(),
                "Usage: !maxqueue [maxUsersInQueue]".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_keeps_thresholds() {
        let h = Harness::new();
        let user = h.users.create_default("u1");
        h.run(&user, "sell", "400").await.unwrap();
        h.run(&user, "stop", "").await.unwrap();

        let stored = h.users.get("u1").unwrap();
        assert!(!stored.polling);
        assert_eq!(stored.sell_price, 400);
        assert_eq!(h.replies()[1], "You have stopped looking for an island.");
    }

    #[tokio::test]
    async fn test_status_messages() {
        let h = Harness::new();
        let user = h.users.create_default("u1");

        h.run(&user, "status", "").await.unwrap();
        h.run(&user, "buy", "100").await.unwrap();
        h.run(&user, "status", "").await.unwrap();
        h.run(&user, "sell", "450").await.unwrap();
        h.run(&user, "status", "").await.unwrap();

        let replies = h.replies();
        assert_eq!(replies[0], "You are not currently looking for islands");
        assert_eq!(
            replies[2],
            "You are currently looking for islands with a turnip price under 100"
        );
        assert_eq!(
            replies[4],
            "You are currently looking for islands with a turnip price over 450"
        );
    }

    #[tokio::test]
    async fn test_custom_command_registration() {
        struct Ping;

        #[async_trait]
        impl ChatCommand for Ping {
            async fn run(
                &self,
                _ctx: &CommandContext<'_>,
                input: CommandInput,
            ) -> Result<(), CommandError> {
                input.reply("pong").await
            }
        }

        let h = Harness::new();
        h.registry.add_command(" PING", Arc::new(Ping));
        let user = h.users.create_default("u1");

        assert!(h.run(&user, "ping", "").await.unwrap());
        assert_eq!(h.replies(), vec!["pong".to_string()]);
        assert!(h.registry.names().contains(&"ping".to_string()));
    }
}
