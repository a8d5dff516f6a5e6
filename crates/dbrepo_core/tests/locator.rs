use dbrepo_core::repo::{derive_fresh, locate};
use dbrepo_core::{
    compose_tx_context, BoxError, DbTxCommitter, EngineRegistry, Hooks, MemoryEngine, RepoSet,
    Repository, TransactionCommitter, TxContext, TxError, TxState,
};
use std::sync::Arc;

#[derive(Default)]
struct AuditRepo {
    table: String,
    ctx: TxContext,
}

compose_tx_context!(AuditRepo => ctx);

impl Repository for AuditRepo {
    fn inherit(&mut self, original: &Self) -> Result<(), BoxError> {
        self.table = original.table.clone();
        Ok(())
    }
}

#[derive(Default)]
struct AccountService {
    audit: Option<Box<AuditRepo>>,
    retries: u32,
}

compose_tx_context!(AccountService => audit);

impl Repository for AccountService {
    fn derive(&self) -> Result<Self, BoxError> {
        let audit = match &self.audit {
            Some(audit) => Some(Box::new(derive_fresh(audit.as_ref())?)),
            None => None,
        };
        Ok(Self {
            audit,
            retries: self.retries,
        })
    }
}

#[derive(Default)]
struct Detached {
    name: String,
}

compose_tx_context!(Detached);
impl Repository for Detached {}

#[derive(Default)]
struct Broken {
    ctx: TxContext,
}

compose_tx_context!(Broken => ctx);

impl Repository for Broken {
    fn inherit(&mut self, _original: &Self) -> Result<(), BoxError> {
        Err("missing connection settings".into())
    }
}

fn registry() -> Arc<EngineRegistry> {
    Arc::new(
        EngineRegistry::builder()
            .engine("default", MemoryEngine::new())
            .build()
            .unwrap(),
    )
}

fn audit(registry: &Arc<EngineRegistry>) -> AuditRepo {
    AuditRepo {
        table: "audit_log".to_string(),
        ctx: TxContext::new(Arc::clone(registry)),
    }
}

#[test]
fn context_is_found_through_option_and_box() {
    let registry = registry();
    let service = AccountService {
        audit: Some(Box::new(audit(&registry))),
        retries: 3,
    };

    let found = locate(&service).unwrap();
    let inner = &service.audit.as_ref().unwrap().ctx;
    assert!(std::ptr::eq(found, inner));

    let empty = AccountService::default();
    let err = locate(&empty).unwrap_err();
    assert!(matches!(err, TxError::StructureNotComposable { .. }));
}

#[test]
fn derived_copy_is_distinct_idle_and_shares_the_registry() {
    let registry = registry();
    let original = audit(&registry);

    let fresh = derive_fresh(&original).unwrap();
    assert_eq!(fresh.table, "audit_log");
    assert_eq!(fresh.ctx.state(), TxState::Idle);
    assert!(fresh.ctx.handle().is_none());
    assert!(Arc::ptr_eq(fresh.ctx.engines().unwrap(), &registry));
    assert!(!std::ptr::eq(&fresh.ctx, &original.ctx));
}

#[test]
fn custom_derive_rebuilds_nested_repositories() {
    let registry = registry();
    let original = AccountService {
        audit: Some(Box::new(audit(&registry))),
        retries: 5,
    };

    let fresh = derive_fresh(&original).unwrap();
    assert_eq!(fresh.retries, 5);
    let nested = fresh.audit.as_ref().unwrap();
    assert_eq!(nested.table, "audit_log");
    assert_eq!(nested.ctx.state(), TxState::Idle);
    assert!(Arc::ptr_eq(nested.ctx.engines().unwrap(), &registry));
}

#[test]
fn type_without_context_is_rejected_before_any_session_opens() {
    let engine = MemoryEngine::new();
    let repos = (Detached {
        name: "plain".to_string(),
    },);

    let err = DbTxCommitter::new()
        .transaction(Hooks::from_logic(|_: &mut (Detached,)| Ok(())), &repos)
        .unwrap_err();
    match err {
        TxError::StructureNotComposable { type_name } => assert!(type_name.contains("Detached")),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(repos.0.name, "plain");
    assert_eq!(engine.stats().sessions_opened, 0);
}

#[test]
fn failing_inherit_is_a_construction_failure() {
    let engine = MemoryEngine::new();
    let registry = Arc::new(
        EngineRegistry::builder()
            .engine("default", engine.clone())
            .build()
            .unwrap(),
    );
    let repos = (Broken {
        ctx: TxContext::new(registry),
    },);

    let err = DbTxCommitter::new()
        .transaction(Hooks::from_logic(|_: &mut (Broken,)| Ok(())), &repos)
        .unwrap_err();
    assert!(matches!(err, TxError::RepoConstructionFailed { .. }));
    assert!(err.to_string().contains("missing connection settings"));
    assert_eq!(engine.stats().sessions_opened, 0);
}

#[test]
fn vec_sets_derive_every_member_in_order() {
    let registry = registry();
    let repos: Vec<AuditRepo> = ["a", "b", "c"]
        .iter()
        .map(|table| AuditRepo {
            table: table.to_string(),
            ctx: TxContext::new(Arc::clone(&registry)),
        })
        .collect();

    let mut derived = repos.derive_all().unwrap();
    let tables: Vec<&str> = derived.iter().map(|repo| repo.table.as_str()).collect();
    assert_eq!(tables, vec!["a", "b", "c"]);
    assert_eq!(derived.contexts_mut().unwrap().len(), 3);
    assert!(Vec::<AuditRepo>::new().is_empty());
}
