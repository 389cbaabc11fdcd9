//! A small order service wired through Khazna.
//!
//! Run with `RUST_LOG=khazna_container=debug cargo run --example basic`
//! to watch registrations, scopes and teardown.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use khazna::prelude::*;
use tracing::info;

trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

struct FixedClock(u64);

impl Clock for FixedClock {
    fn now(&self) -> u64 {
        self.0
    }
}

khazna::implements!(FixedClock => dyn Clock);

static NEXT_SESSION: AtomicUsize = AtomicUsize::new(1);

struct DbSession {
    id: usize,
}

impl Dispose for DbSession {
    fn dispose(&self) {
        info!(session = self.id, "Session closed");
    }
}

impl Injectable for DbSession {
    fn constructors(ctors: &mut Constructors<Self>) {
        ctors.nullary(|| DbSession {
            id: NEXT_SESSION.fetch_add(1, Ordering::Relaxed),
        });
    }

    fn disposer(instance: &Arc<Self>) -> Option<Arc<dyn Dispose>> {
        Some(instance.clone())
    }
}

struct Checkout {
    clock: Arc<dyn Clock>,
    session: Arc<DbSession>,
    currency: String,
}

impl Injectable for Checkout {
    fn constructors(ctors: &mut Constructors<Self>) {
        ctors.add(
            vec![
                ParamDecl::service::<dyn Clock>("clock"),
                ParamDecl::service::<DbSession>("session"),
                ParamDecl::value_or("currency", String::from("EUR")),
            ],
            |args| {
                Ok(Checkout {
                    clock: args.service(0)?,
                    session: args.service(1)?,
                    currency: args.take(2)?,
                })
            },
        );
    }
}

struct ShopProvider;

impl Provider for ShopProvider {
    fn register(&self, container: &Container) -> Result<()> {
        container
            .for_type::<dyn Clock>()
            .register_factory(|_, _| Ok(FixedClock(1_700_000_000)))?
            .resolve_as_singleton()?;
        container
            .for_type::<DbSession>()
            .register::<DbSession>()?
            .resolve_an_instance_per_scope()?;
        container.for_type::<Checkout>().register::<Checkout>()?;
        Ok(())
    }
}

fn main() -> Result<()> {
    khazna::logging::init_tracing();

    let root = RootContainer::new();
    root.add_provider(&ShopProvider)?;

    for request_no in 1..=2 {
        let request = root.child();
        let checkout: Arc<Checkout> = request.resolve()?;
        let again: Arc<Checkout> = request.resolve()?;
        info!(
            request_no,
            session = checkout.session.id,
            shared = Arc::ptr_eq(&checkout.session, &again.session),
            at = checkout.clock.now(),
            currency = %checkout.currency,
            "Checkout ready"
        );
        println!("{}", request.lineage());
        request.dispose();
    }

    if let Err(err) = root.resolve::<dyn std::any::Any + Send + Sync>() {
        println!("{err}");
    }

    Ok(())
}
