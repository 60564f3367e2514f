use v8::{HandleScope, ObjectTemplate};

/// Host extension installed into the global template before the context
/// is created. Adjuncts stay alive, at a stable address, for as long as
/// the machine thread runs, so they may hand `self` to V8 as external data.
pub trait Adjunct: Send + 'static {
    fn install(&self, scope: &mut HandleScope<()>, global: &ObjectTemplate);
}
