//! Walks two readers through a complete swap against a throwaway database.
//!
//! cargo run --example marketplace

use book_exchange::ledger::NewBook;
use book_exchange::matching::MatchFilter;
use book_exchange::service::NewProposal;
use book_exchange::store::Store;
use book_exchange::{Config, Marketplace};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("book_exchange=debug").init();

    let dir = tempfile_dir()?;
    let market = Marketplace::new(&Config::default(), Store::open(dir.join("demo.db"))?);

    let ana = market.directory.register_user("Ana", "Lisbon")?;
    let ben = market.directory.register_user("Ben", "Lisbon")?;

    let dune = market.ledger.add_book(&ana.id, NewBook::inventory("Dune", "Frank Herbert"))?;
    market.ledger.add_book(&ana.id, NewBook::wishlist("Foundation", "Isaac Asimov"))?;
    let foundation = market
        .ledger
        .add_book(&ben.id, NewBook::inventory("Foundation", "Isaac Asimov"))?;
    market.ledger.add_book(&ben.id, NewBook::wishlist("Dune", "Frank Herbert"))?;

    let matches = market.matches.list_matches(&ana.id, &MatchFilter::All)?;
    let Some(found) = matches.first() else {
        anyhow::bail!("expected Ana and Ben to match");
    };
    println!("{} -> {}: {:?}", ana.name, ben.name, found.match_type);

    market.directory.open_chat(&ana.id, &ben.id)?;
    let proposal = market.trades.create_trade_proposal(
        &ana.id,
        NewProposal {
            match_id: found.id.clone(),
            books_offered: vec![dune.id.clone()],
            books_requested: vec![foundation.id.clone()],
            lock_duration_hours: None,
        },
    )?;
    for lock in &proposal.locks {
        println!("locked {} until {:?}", lock.book_id, lock.expires_at.to_datetime_utc());
    }

    let summary = market.trades.accept_trade(&ben.id, &proposal.trade.id)?;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    drop(market);
    std::fs::remove_dir_all(&dir)?;
    Ok(())
}

fn tempfile_dir() -> anyhow::Result<std::path::PathBuf> {
    let dir = std::env::temp_dir().join(book_exchange::utils::new_uuid_to_bech32("demo")?);
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
