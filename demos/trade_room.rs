//! Trade room walkthrough
//!
//! Opens a throwaway sled database, registers a few cards and walks one trade
//! from draft to completed, then prints the resulting trust scores.
//!
//! Run with `cargo run --example trade_room`.

use std::sync::Arc;

use anyhow::Result;
use card_trade::{
    NewTrade, TradeService, TradeStatus,
    config::MarketConfig,
    matching::PartnerFilter,
    offer::Card,
    trust::{TrustGrade, UserProfile},
    utils::new_uuid_to_bech32,
};
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let dir = tempfile::tempdir()?;
    let config = MarketConfig {
        db_path: dir.path().join("market.db"),
        ..MarketConfig::load(None)?
    };
    let db = Arc::new(sled::open(&config.db_path)?);
    let service = TradeService::with_config(db, config)?;

    for (id, name) in [("sv1-25", "Pikachu"), ("sv1-6", "Charizard"), ("sv2-81", "Mew")] {
        service.register_card(&Card::new(id, name))?;
    }

    let alice = new_uuid_to_bech32("user")?;
    let bob = new_uuid_to_bech32("user")?;
    let verified = UserProfile {
        email_verified: true,
        x_linked: true,
    };
    service.upsert_profile(&alice, &verified)?;
    service.upsert_profile(&bob, &verified)?;

    let trade = service.create_trade(NewTrade::new(&alice).set_initial_card("sv1-25"))?;
    info!(room = %trade.room_slug, "room opened");

    // bob joins through the room link and puts up his side
    let trade = service.set_responder(&trade, &bob)?;
    let aggregate = service.update_offer(&trade, &bob, &["sv1-6", "sv2-81"])?;
    info!(offers = aggregate.offers.len(), "offers on the table");

    let trade = service.transition_trade(&aggregate.trade, TradeStatus::Proposed, &alice, None)?;
    let trade = service.transition_trade(&trade, TradeStatus::Agreed, &bob, None)?;
    let trade = service.transition_trade(&trade, TradeStatus::Completed, &alice, None)?;
    info!(status = %trade.status, version = trade.version, "trade settled");

    service.submit_review(&trade.id, &alice, 5, Some("fast shipping"))?;
    service.submit_review(&trade.id, &bob, 4, None)?;

    for user in [&alice, &bob] {
        if let Some(score) = service.trust_score(user)? {
            info!(
                user = %score.user_id,
                score = score.trust_score,
                grade = %score.trust_grade,
                "trust"
            );
        }
    }

    let partners = service.find_partners(&PartnerFilter::new(TrustGrade::B).excluding(&alice))?;
    info!(count = partners.len(), "partners for alice at grade B or better");

    service.store().flush()?;
    Ok(())
}
