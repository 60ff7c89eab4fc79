//! API Routes
//!
//! HTTP endpoint definitions.

use axum::{
    extract::{Extension, Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::audit::reconcile_account;
use crate::domain::{Account, Entry, OperationContext, Transfer};
use crate::error::{AppError, AppResult};
use crate::handlers::{TransferCommand, TransferResult};
use crate::store::{run_in_transaction, LedgerTx, StoreError, UnitOfWork};

use super::middleware::REQUEST_USER_HEADER;
use super::AppState;

/// Currencies a transfer may be requested in
pub const SUPPORTED_CURRENCIES: &[&str] = &["USD", "EUR", "CAD"];

// =========================================================================
// Request/Response types
// =========================================================================

#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub amount: i64,
    pub currency: String,
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

impl PageQuery {
    fn validate(&self) -> AppResult<()> {
        if !(1..=100).contains(&self.limit) {
            return Err(AppError::InvalidRequest(format!(
                "limit must be between 1 and 100 (got {})",
                self.limit
            )));
        }
        if self.offset < 0 {
            return Err(AppError::InvalidRequest(format!(
                "offset must not be negative (got {})",
                self.offset
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
pub struct AccountAuditResponse {
    pub account_id: i64,
    pub balance: i64,
    pub entries_total: i64,
    pub consistent: bool,
}

// =========================================================================
// API Router
// =========================================================================

/// Create the API router
pub fn create_router<S: UnitOfWork + 'static>() -> Router<AppState<S>> {
    Router::new()
        .route("/accounts", get(list_accounts::<S>))
        .route("/accounts/:account_id", get(get_account::<S>))
        .route("/accounts/:account_id/entries", get(list_entries::<S>))
        .route("/accounts/:account_id/audit", get(audit_account::<S>))
        .route("/transfers", post(transfer::<S>))
        .route("/transfers/:transfer_id", get(get_transfer::<S>))
}

// =========================================================================
// Helpers
// =========================================================================

fn require_request_user(context: &OperationContext) -> AppResult<&str> {
    context
        .request_user
        .as_deref()
        .ok_or_else(|| AppError::MissingHeader(REQUEST_USER_HEADER.to_string()))
}

fn ensure_supported_currency(currency: &str) -> AppResult<()> {
    if SUPPORTED_CURRENCIES.contains(&currency) {
        Ok(())
    } else {
        Err(AppError::InvalidRequest(format!(
            "unsupported currency: {}",
            currency
        )))
    }
}

fn ensure_currency(account: &Account, currency: &str) -> AppResult<()> {
    if account.currency != currency {
        return Err(AppError::CurrencyMismatch {
            account_id: account.id,
            expected: currency.to_string(),
            found: account.currency.clone(),
        });
    }
    Ok(())
}

fn ensure_owner(context: &OperationContext, account: &Account) -> AppResult<()> {
    if require_request_user(context)? != account.owner {
        return Err(AppError::Forbidden(format!(
            "account {} does not belong to the request user",
            account.id
        )));
    }
    Ok(())
}

async fn load_account<S: UnitOfWork>(
    store: &S,
    ctx: &OperationContext,
    account_id: i64,
) -> Result<Account, StoreError> {
    run_in_transaction(store, ctx, move |tx| {
        Box::pin(async move { tx.get_account(account_id).await })
    })
    .await
}

// =========================================================================
// GET /accounts
// =========================================================================

/// List the request user's accounts
async fn list_accounts<S: UnitOfWork + 'static>(
    State(state): State<AppState<S>>,
    Extension(context): Extension<OperationContext>,
    Query(page): Query<PageQuery>,
) -> AppResult<Json<Vec<Account>>> {
    page.validate()?;
    let owner = require_request_user(&context)?.to_string();
    let ctx = state.operation_context(context);

    let accounts = run_in_transaction(state.handler.store(), &ctx, move |tx| {
        Box::pin(async move { tx.list_accounts(&owner, page.limit, page.offset).await })
    })
    .await
    .map_err(AppError::from)?;

    Ok(Json(accounts))
}

// =========================================================================
// GET /accounts/:account_id
// =========================================================================

async fn get_account<S: UnitOfWork + 'static>(
    State(state): State<AppState<S>>,
    Extension(context): Extension<OperationContext>,
    Path(account_id): Path<i64>,
) -> AppResult<Json<Account>> {
    let ctx = state.operation_context(context);
    let account = load_account(state.handler.store(), &ctx, account_id).await?;
    ensure_owner(&ctx, &account)?;

    Ok(Json(account))
}

// =========================================================================
// GET /accounts/:account_id/entries
// =========================================================================

async fn list_entries<S: UnitOfWork + 'static>(
    State(state): State<AppState<S>>,
    Extension(context): Extension<OperationContext>,
    Path(account_id): Path<i64>,
    Query(page): Query<PageQuery>,
) -> AppResult<Json<Vec<Entry>>> {
    page.validate()?;
    let ctx = state.operation_context(context);
    let account = load_account(state.handler.store(), &ctx, account_id).await?;
    ensure_owner(&ctx, &account)?;

    let entries = run_in_transaction(state.handler.store(), &ctx, move |tx| {
        Box::pin(async move { tx.list_entries(account_id, page.limit, page.offset).await })
    })
    .await
    .map_err(AppError::from)?;

    Ok(Json(entries))
}

// =========================================================================
// GET /accounts/:account_id/audit
// =========================================================================

/// Compare the stored balance with the sum of the account's entries
async fn audit_account<S: UnitOfWork + 'static>(
    State(state): State<AppState<S>>,
    Extension(context): Extension<OperationContext>,
    Path(account_id): Path<i64>,
) -> AppResult<Json<AccountAuditResponse>> {
    let ctx = state.operation_context(context);

    let reconciliation = run_in_transaction(state.handler.store(), &ctx, move |tx| {
        Box::pin(async move { reconcile_account(tx, account_id).await })
    })
    .await
    .map_err(AppError::from)?;

    if !reconciliation.is_consistent() {
        tracing::error!(
            account_id,
            balance = reconciliation.balance,
            entries_total = reconciliation.entries_total,
            "Ledger mismatch: balance differs from entry total"
        );
    }

    Ok(Json(AccountAuditResponse {
        account_id,
        balance: reconciliation.balance,
        entries_total: reconciliation.entries_total,
        consistent: reconciliation.is_consistent(),
    }))
}

// =========================================================================
// POST /transfers
// =========================================================================

/// Move funds between two accounts of the same currency.
///
/// Both accounts must exist and hold the request currency, and the request
/// user must own the source account.
async fn transfer<S: UnitOfWork + 'static>(
    State(state): State<AppState<S>>,
    Extension(context): Extension<OperationContext>,
    Json(request): Json<TransferRequest>,
) -> AppResult<Json<TransferResult>> {
    let request_user = require_request_user(&context)?.to_string();
    ensure_supported_currency(&request.currency)?;

    let command = TransferCommand::new(
        request.from_account_id,
        request.to_account_id,
        request.amount,
    );
    command.validate()?;

    let ctx = state.operation_context(context);
    let store = state.handler.store();

    let from_account = load_account(store, &ctx, command.from_account_id).await?;
    ensure_currency(&from_account, &request.currency)?;
    if from_account.owner != request_user {
        return Err(AppError::UnauthorizedTransfer);
    }

    let to_account = load_account(store, &ctx, command.to_account_id).await?;
    ensure_currency(&to_account, &request.currency)?;

    let result = state.handler.execute_with_retry(&ctx, command).await?;

    Ok(Json(result))
}

// =========================================================================
// GET /transfers/:transfer_id
// =========================================================================

/// Fetch a transfer; visible to the owners of either side
async fn get_transfer<S: UnitOfWork + 'static>(
    State(state): State<AppState<S>>,
    Extension(context): Extension<OperationContext>,
    Path(transfer_id): Path<i64>,
) -> AppResult<Json<Transfer>> {
    let ctx = state.operation_context(context);
    let request_user = require_request_user(&ctx)?.to_string();

    let (transfer, from_owner, to_owner) =
        run_in_transaction(state.handler.store(), &ctx, move |tx| {
            Box::pin(async move {
                let transfer = tx.get_transfer(transfer_id).await?;
                let from = tx.get_account(transfer.from_account_id).await?;
                let to = tx.get_account(transfer.to_account_id).await?;
                Ok::<_, StoreError>((transfer, from.owner, to.owner))
            })
        })
        .await
        .map_err(AppError::from)?;

    if request_user != from_owner && request_user != to_owner {
        return Err(AppError::Forbidden(format!(
            "transfer {} does not involve the request user",
            transfer_id
        )));
    }

    Ok(Json(transfer))
}
