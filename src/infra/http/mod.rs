mod middleware;
mod public;

pub use middleware::{
    RequestContext, caller_identity, log_responses, resolve_caller, set_request_context,
};
pub use public::{HttpState, build_router};
