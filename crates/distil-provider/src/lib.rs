mod provider;

pub use provider::{
    infer_provider, InvokeRequest, ModelLimits, Provider, ProviderError, RateLimit,
};
