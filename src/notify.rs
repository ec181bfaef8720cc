//! Fire-and-forget notifications about trade activity
use super::trade::TradeStatus;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarketEvent {
    TradeStateChanged {
        trade_id: String,
        room_slug: String,
        from: TradeStatus,
        to: TradeStatus,
        actor: Option<String>, // None for expiry sweeps and moderation
    },
    ReviewReceived {
        trade_id: String,
        reviewee_user_id: String,
        rating: u8,
    },
}

/// Delivery is best effort. Errors are logged by the caller and never undo
/// the write that produced the event.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: &MarketEvent) -> anyhow::Result<()>;
}

/// Writes events to the log. Used when no delivery channel is wired up.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: &MarketEvent) -> anyhow::Result<()> {
        match event {
            MarketEvent::TradeStateChanged {
                trade_id,
                from,
                to,
                actor,
                ..
            } => info!(%trade_id, %from, %to, actor = actor.as_deref(), "trade state changed"),
            MarketEvent::ReviewReceived {
                trade_id,
                reviewee_user_id,
                rating,
            } => info!(%trade_id, %reviewee_user_id, rating, "review received"),
        }
        Ok(())
    }
}
