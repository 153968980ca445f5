
use std::sync::Arc;

use async_trait::async_trait;

use crate::kernel::context::ModuleContext;
use crate::kernel::error::Result;
use crate::module_system::descriptor::ModuleDescriptor;
use crate::module_system::traits::Module;

/// Module that does nothing; only its descriptor matters to these tests.
pub struct Stub(pub String);

#[async_trait]
impl Module for Stub {
    fn name(&self) -> &str {
        &self.0
    }

    fn version(&self) -> &str {
        "0.1.0"
    }

    async fn init(&self, _ctx: &ModuleContext) -> Result<()> {
        Ok(())
    }
}

pub fn stub(name: &str) -> ModuleDescriptor {
    let owned = name.to_string();
    let factory = move || Arc::new(Stub(owned.clone())) as Arc<dyn Module>;
    ModuleDescriptor::new(name, "0.1.0", factory)
}
