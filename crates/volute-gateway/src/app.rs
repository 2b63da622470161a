use axum::{
    middleware,
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;
use volute_budget::TokenBudget;
use volute_core::config::DaemonConfig;
use volute_core::home::VoluteHome;
use volute_events::{ActivityTracker, EventBus, TypingMap};
use volute_registry::Registry;
use volute_scheduler::Scheduler;
use volute_store::StateStore;
use volute_supervisor::MindSupervisor;

/// Central shared state, handed to every handler as `State<Arc<AppState>>`.
pub struct AppState {
    pub config: DaemonConfig,
    /// The boot bearer token, always present after bootstrap.
    pub token: String,
    pub home: VoluteHome,
    pub registry: Arc<Registry>,
    pub store: Arc<StateStore>,
    pub bus: Arc<EventBus>,
    pub activity: Arc<ActivityTracker>,
    pub typing: Arc<TypingMap>,
    pub budget: Arc<TokenBudget>,
    pub scheduler: Arc<Scheduler>,
    pub supervisor: Arc<MindSupervisor>,
    /// Client for talking to mind processes.
    pub http: reqwest::Client,
}

/// Assemble the full router: a small unauthenticated surface plus the
/// token/cookie-guarded API behind the auth and CSRF layers.
pub fn build_router(state: Arc<AppState>) -> Router {
    let public = Router::new()
        .route("/api/health", get(crate::http::health::health_handler))
        .route("/api/auth/register", post(crate::http::auth_routes::register))
        .route("/api/auth/login", post(crate::http::auth_routes::login))
        .route("/pages/{mind}/{*path}", get(crate::http::pages::serve_page));

    let protected = Router::new()
        .route("/api/auth/logout", post(crate::http::auth_routes::logout))
        .route("/api/auth/me", get(crate::http::auth_routes::me))
        .route("/api/users", get(crate::http::auth_routes::list_users))
        .route(
            "/api/users/{id}/role",
            put(crate::http::auth_routes::set_user_role),
        )
        .route(
            "/api/minds",
            get(crate::http::minds::list_minds).post(crate::http::minds::create_mind),
        )
        .route("/api/agents", get(crate::http::minds::list_minds))
        .route(
            "/api/minds/{name}",
            get(crate::http::minds::get_mind).delete(crate::http::minds::delete_mind),
        )
        .route("/api/minds/{name}/start", post(crate::http::minds::start_mind))
        .route("/api/minds/{name}/stop", post(crate::http::minds::stop_mind))
        .route(
            "/api/minds/{name}/restart",
            post(crate::http::minds::restart_mind),
        )
        .route("/api/minds/{name}/wake", post(crate::http::minds::wake_mind))
        .route(
            "/api/minds/{name}/stage",
            put(crate::http::minds::set_stage),
        )
        .route(
            "/api/minds/{name}/budget",
            get(crate::http::minds::get_budget).put(crate::http::minds::set_budget),
        )
        .route(
            "/api/minds/{name}/message",
            post(crate::pipeline::message_handler),
        )
        .route("/api/minds/{name}/history", get(crate::http::minds::history))
        .route(
            "/api/minds/{name}/schedules",
            get(crate::http::minds::schedules),
        )
        .route(
            "/api/minds/{name}/channels",
            get(crate::http::minds::get_channel_map).put(crate::http::minds::put_channel_map),
        )
        .route(
            "/api/minds/{name}/env",
            get(crate::http::minds::list_mind_env),
        )
        .route(
            "/api/minds/{name}/env/{key}",
            put(crate::http::minds::put_mind_env).delete(crate::http::minds::delete_mind_env),
        )
        .route(
            "/api/minds/{name}/variants",
            get(crate::http::minds::list_variants).post(crate::http::minds::create_variant),
        )
        .route(
            "/api/minds/{name}/variants/{variant}",
            delete(crate::http::minds::delete_variant),
        )
        .route("/api/env", get(crate::http::env_routes::list_shared_env))
        .route(
            "/api/env/{key}",
            put(crate::http::env_routes::put_shared_env)
                .delete(crate::http::env_routes::delete_shared_env),
        )
        .route("/api/events", get(crate::http::events::event_stream))
        .route("/api/activity", get(crate::http::events::recent_activity))
        .route("/api/typing", post(crate::http::events::set_typing))
        .route(
            "/api/typing/{sender}",
            delete(crate::http::events::clear_typing),
        )
        .route(
            "/api/volute/channels",
            get(crate::http::channels::list_channels).post(crate::http::channels::create_channel),
        )
        .route(
            "/api/volute/channels/{name}/join",
            post(crate::http::channels::join_channel),
        )
        .route(
            "/api/volute/channels/{name}/leave",
            post(crate::http::channels::leave_channel),
        )
        .route(
            "/api/volute/channels/{name}/invite",
            post(crate::http::channels::invite_member),
        )
        .route(
            "/api/volute/channels/{name}/members",
            get(crate::http::channels::list_members),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            crate::auth::require_auth,
        ));

    public
        .merge(protected)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            crate::auth::csrf_guard,
        ))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}
