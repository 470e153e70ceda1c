//! Poll-match-notify orchestration.
//!
//! Each cycle snapshots the polling users, pulls new islands from every
//! source and sends each user the islands that pass all of their filters.
//! Inbound chat messages are handled concurrently through
//! [`TurnipFinder::handle_message`]; both paths share the user directory.

use crate::commands::{parse_command, CommandError, CommandInput, CommandRegistry, PriceLimits};
use crate::config::Config;
use crate::filters;
use crate::island::{Island, IslandRegistry};
use crate::notify::{format_island_message, send_with_retry, MessageSender, RetryPolicy};
use crate::sources::IslandSource;
use crate::users::{User, UserDirectory};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
pub struct FinderSettings {
    pub limits: PriceLimits,
    pub retry: RetryPolicy,
    pub command_prefix: String,
}

impl FinderSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            limits: PriceLimits {
                min: config.finder.min_price_allowed,
                max: config.finder.max_price_allowed,
            },
            retry: RetryPolicy::from_config(&config.notify),
            command_prefix: config.discord.command_prefix.clone(),
        }
    }
}

impl Default for FinderSettings {
    fn default() -> Self {
        Self {
            limits: PriceLimits { min: 15, max: 800 },
            retry: RetryPolicy::default(),
            command_prefix: crate::commands::DEFAULT_PREFIX.to_string(),
        }
    }
}

/// Summary of one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub active_users: usize,
    pub new_islands: usize,
    pub notified: usize,
    pub failed: usize,
}

/// What happened to an inbound chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Not a command.
    Ignored,
    Handled,
    /// Prefixed, but no command is registered under this name.
    UnknownCommand(String),
}

/// Returns true when every criterion the user has set admits the island.
pub fn user_wants(user: &User, island: &Island) -> bool {
    if user.sell_price > 0 && !filters::min_price(island, user.sell_price) {
        return false;
    }
    if user.buy_price > 0 && !filters::max_price(island, user.buy_price) {
        return false;
    }
    if !user.exclude_prices.is_empty() && !filters::exclude_prices(island, &user.exclude_prices) {
        return false;
    }
    if user.max_in_queue >= 0 && !filters::max_queue_size(island, user.max_in_queue) {
        return false;
    }
    true
}

pub struct TurnipFinder {
    users: UserDirectory,
    registry: IslandRegistry,
    commands: CommandRegistry,
    sender: Arc<dyn MessageSender>,
    settings: FinderSettings,
}

impl TurnipFinder {
    pub fn new(sender: Arc<dyn MessageSender>, settings: FinderSettings) -> Self {
        Self {
            users: UserDirectory::new(),
            registry: IslandRegistry::new(),
            commands: CommandRegistry::with_defaults(),
            sender,
            settings,
        }
    }

    pub fn users(&self) -> &UserDirectory {
        &self.users
    }

    pub fn registry(&self) -> &IslandRegistry {
        &self.registry
    }

    pub fn commands(&self) -> &CommandRegistry {
        &self.commands
    }

    pub async fn add_source(&self, source: Box<dyn IslandSource>) {
        self.registry.add_source(source).await;
    }

    pub async fn send_user_island(&self, user: &User, island: &Island) -> bool {
        let msg = format_island_message(island);
        match send_with_retry(self.sender.as_ref(), self.settings.retry, &user.id, &msg).await {
            Ok(()) => {
                debug!(user = %user.id, island = %island.id, "notified user");
                true
            }
            Err(e) => {
                error!(
                    user = %user.id,
                    island = %island.id,
                    error = %e,
                    "giving up on island notification"
                );
                false
            }
        }
    }

    pub async fn run_cycle(&self) -> CycleReport {
        let polling_users = self.users.active_users();
        let mut report = CycleReport {
            active_users: polling_users.len(),
            ..Default::default()
        };
        if polling_users.is_empty() {
            return report;
        }

        let new_islands = self.registry.poll_sources().await;
        report.new_islands = new_islands.len();

        for island in &new_islands {
            info!(
                in_queue = island.in_queue,
                max_queue = island.max_queue,
                name = %island.name,
                price = island.turnip_price,
                url = %island.url,
                "new island"
            );

            for user in polling_users.iter().filter(|u| user_wants(u, island)) {
                if self.send_user_island(user, island).await {
                    report.notified += 1;
                } else {
                    report.failed += 1;
                }
            }
        }

        report
    }

    /// Poll forever with a fixed sleep between cycles.
    pub async fn run(&self, interval: Duration) {
        info!(interval = ?interval, "poll loop started");
        loop {
            let report = self.run_cycle().await;
            if report.new_islands > 0 {
                info!(
                    users = report.active_users,
                    islands = report.new_islands,
                    notified = report.notified,
                    failed = report.failed,
                    tracked = self.registry.len(),
                    "poll cycle complete"
                );
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Handle one inbound chat message from `author_id`.
    pub async fn handle_message(
        &self,
        author_id: &str,
        author_name: &str,
        content: &str,
    ) -> Result<MessageOutcome, CommandError> {
        let Some((name, args)) = parse_command(content, &self.settings.command_prefix) else {
            return Ok(MessageOutcome::Ignored);
        };

        let user = self.users.get_or_create(author_id, author_name);
        let input = CommandInput {
            name: name.clone(),
            args,
            user,
            sender: self.sender.clone(),
        };

        let handled = self
            .commands
            .dispatch(&self.users, self.settings.limits, input)
            .await?;

        if handled {
            Ok(MessageOutcome::Handled)
        } else {
            Ok(MessageOutcome::UnknownCommand(name))
        }
    }
}
