//! # Khazna: a scoped IoC container for Rust
//!
//! Registrations live in a tree of containers: a child specializes what it
//! needs and defers everything else to its parents. Instances are handed
//! out per request, per scope or as singletons, and disposable ones are
//! released with the container that owns them.
//!
//! ```rust
//! use khazna::prelude::*;
//! use std::sync::Arc;
//!
//! trait Greeter: Send + Sync {
//!     fn greet(&self) -> String;
//! }
//!
//! struct English;
//! impl Greeter for English {
//!     fn greet(&self) -> String { "hello".into() }
//! }
//! impl Injectable for English {
//!     fn constructors(ctors: &mut Constructors<Self>) {
//!         ctors.nullary(|| English);
//!     }
//! }
//! khazna::implements!(English => dyn Greeter);
//!
//! let root = RootContainer::new();
//! root.for_type::<dyn Greeter>().register::<English>()?;
//! let greeter: Arc<dyn Greeter> = root.child().resolve()?;
//! assert_eq!(greeter.greet(), "hello");
//! # Ok::<(), KhaznaError>(())
//! ```

pub use khazna_container::*;
pub use khazna_support::*;

#[cfg(test)]
mod tests {
    use super::prelude::*;
    use khazna_container::implements;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl Counter {
        fn bump(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }

        fn get(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    struct AppConfig {
        currency: String,
    }

    struct Session {
        id: usize,
        closed: AtomicBool,
        closes: Arc<Counter>,
    }

    impl Dispose for Session {
        fn dispose(&self) {
            self.closed.store(true, Ordering::SeqCst);
            self.closes.bump();
        }
    }

    trait Orders: Send + Sync {
        fn session(&self) -> &Arc<Session>;
        fn describe(&self, amount: u32) -> String;
    }

    struct OrderService {
        session: Arc<Session>,
        config: Arc<AppConfig>,
    }

    impl Orders for OrderService {
        fn session(&self) -> &Arc<Session> {
            &self.session
        }

        fn describe(&self, amount: u32) -> String {
            format!("{amount} {} on session {}", self.config.currency, self.session.id)
        }
    }

    impl Injectable for OrderService {
        fn constructors(ctors: &mut Constructors<Self>) {
            ctors.add(
                vec![
                    ParamDecl::service::<Session>("session"),
                    ParamDecl::service::<AppConfig>("config"),
                ],
                |args| {
                    Ok(OrderService {
                        session: args.service(0)?,
                        config: args.service(1)?,
                    })
                },
            );
        }
    }

    implements!(OrderService => dyn Orders);

    fn application(closes: Arc<Counter>) -> RootContainer {
        let root = RootContainer::new();
        let sessions = Arc::new(Counter::default());

        root.for_type::<AppConfig>()
            .register_factory(|_, _| {
                Ok(AppConfig {
                    currency: "EUR".into(),
                })
            })
            .unwrap()
            .resolve_as_singleton()
            .unwrap();
        root.for_type::<Session>()
            .register_disposable_factory(move |_, _| {
                sessions.bump();
                Ok(Session {
                    id: sessions.get(),
                    closed: AtomicBool::new(false),
                    closes: closes.clone(),
                })
            })
            .unwrap()
            .resolve_an_instance_per_scope()
            .unwrap();
        root.for_type::<dyn Orders>()
            .register::<OrderService>()
            .unwrap();
        root
    }

    #[test]
    fn request_scopes_share_sessions_within_and_not_across() {
        let closes = Arc::new(Counter::default());
        let root = application(closes.clone());

        let first = root.child();
        let a = first.resolve::<dyn Orders>().unwrap();
        let b = first.resolve::<dyn Orders>().unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(a.session(), b.session()));

        let second = root.child();
        let c = second.resolve::<dyn Orders>().unwrap();
        assert!(!Arc::ptr_eq(a.session(), c.session()));

        first.dispose();
        assert!(a.session().closed.load(Ordering::SeqCst));
        assert!(!c.session().closed.load(Ordering::SeqCst));
        assert_eq!(closes.get(), 1);

        second.dispose();
        assert_eq!(closes.get(), 2);
    }

    #[test]
    fn handlers_find_their_request_through_the_context_flow() {
        let root = application(Arc::new(Counter::default()));

        fn handle(amount: u32) -> Result<String> {
            let request = ContextFlow::current().expect("handler runs inside a request");
            Ok(request.resolve::<dyn Orders>()?.describe(amount))
        }

        let request = root.child();
        let text = handle(12).unwrap();
        assert!(text.starts_with("12 EUR"));
        request.dispose();
    }

    #[test]
    fn request_work_can_move_to_another_thread() {
        let closes = Arc::new(Counter::default());
        let root = application(closes.clone());

        let request = root.child();
        let capture = ContextFlow::capture().unwrap();
        request.dispose();
        assert_eq!(closes.get(), 0);

        let handle = std::thread::spawn(move || {
            let guard = capture.attach();
            let orders = guard.container().resolve::<dyn Orders>().unwrap();
            orders.describe(3)
        });
        assert!(handle.join().unwrap().contains("EUR"));
        assert!(request.is_disposed());
        assert_eq!(closes.get(), 1);
    }

    #[test]
    fn root_observers_see_every_request() {
        let root = application(Arc::new(Counter::default()));
        let created = Arc::new(Counter::default());
        let reissued = Arc::new(Counter::default());
        let (c, r) = (created.clone(), reissued.clone());

        root.subscribe::<Session, _>(move |event| match event.kind {
            CreationEventKind::Created => c.bump(),
            CreationEventKind::Reissued => r.bump(),
            _ => {}
        });

        let request = root.child();
        request.resolve::<dyn Orders>().unwrap();
        request.resolve::<dyn Orders>().unwrap();
        assert_eq!(created.get(), 1);
        assert_eq!(reissued.get(), 1);
    }

    #[test]
    fn tenants_customise_configuration() {
        let root = application(Arc::new(Counter::default()));
        let tenant = root.register_tenant("us-shop");
        tenant
            .for_type::<AppConfig>()
            .register_factory(|_, _| {
                Ok(AppConfig {
                    currency: "USD".into(),
                })
            })
            .unwrap()
            .resolve_as_singleton()
            .unwrap();

        let us = root.resolve_tenant_by_id(&TenantId::from("us-shop")).unwrap();
        let eu = root.child();
        assert!(us.resolve::<dyn Orders>().unwrap().describe(1).contains("USD"));
        assert!(eu.resolve::<dyn Orders>().unwrap().describe(1).contains("EUR"));
    }

    #[test]
    fn rendering_helpers_are_reexported() {
        assert_eq!(crate::rendering::shorten_type_name("shop::orders::OrderService"), "OrderService");
        let err = RootContainer::new().resolve::<dyn Orders>().err().unwrap();
        assert!(err.to_string().contains("Hint"));
    }
}
