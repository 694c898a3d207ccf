use minijinja::Environment;
use rust_embed::RustEmbed;
use std::sync::Arc;

/// HTML templates compiled into the binary.
#[derive(RustEmbed)]
#[folder = "templates/"]
struct TemplateAssets;

/// Build the shared minijinja environment from the embedded template files.
/// Called once at startup; a broken template is a programming error and
/// fails fast.
pub fn build_environment() -> Arc<Environment<'static>> {
    let mut env = Environment::new();
    for name in TemplateAssets::iter() {
        let asset =
            TemplateAssets::get(name.as_ref()).expect("embedded template listed but not found");
        let source =
            String::from_utf8(asset.data.into_owned()).expect("template is not valid UTF-8");
        env.add_template_owned(name.to_string(), source)
            .expect("invalid embedded template");
    }
    Arc::new(env)
}
