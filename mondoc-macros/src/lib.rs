//! Procedural macros for the mondoc project.
//!
//! `#[derive(Model)]` turns a serde struct into a model: it generates the
//! `Model` implementation whose schema is built once, on first use, from the
//! struct's fields and its `#[mondoc(...)]` attributes.
//!
//! # Struct attributes
//!
//! - `collection = "name"`: the collection (defaults to the snake-cased,
//!   pluralized type name)
//! - `connection = "name"`: binds the model to a named connection
//! - `configure = "path::to::fn"`: a `fn(SchemaBuilder<Self>) -> SchemaBuilder<Self>`
//!   that adds rules, relations, computed values and hooks
//! - `crate = "path"`: where the mondoc facade lives (defaults to `::mondoc`)
//!
//! # Field attributes
//!
//! - `primary`: the primary key (stored as `_id` unless `column` says otherwise)
//! - `column = "name"`: the stored name
//! - `auto_create` / `auto_update`: timestamp stamping on insert / on every save
//! - `embedded`: the field holds embedded documents (`Vec<_>` means many)
//! - `hidden`: left out of serialized output
//! - `serialize_as = "name"`: the key used in serialized output
//!
//! Field names follow serde: `rename` and container `rename_all` are honoured,
//! and fields serde skips are not part of the schema.
//!
//! ```ignore
//! #[derive(Debug, Clone, Serialize, Deserialize, Model)]
//! #[mondoc(collection = "users", configure = "user_schema")]
//! pub struct User {
//!     #[mondoc(primary)]
//!     #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
//!     pub id: Option<ObjectId>,
//!     #[mondoc(column = "mail")]
//!     pub email: String,
//!     #[mondoc(embedded)]
//!     #[serde(default)]
//!     pub addresses: Vec<Address>,
//!     #[mondoc(auto_create)]
//!     pub created_at: Option<DateTime>,
//! }
//!
//! fn user_schema(schema: SchemaBuilder<User>) -> SchemaBuilder<User> {
//!     schema.rule("email", Rule::Required)
//! }
//! ```

#[allow(unused_extern_crates)]
extern crate self as mondoc_macros;

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{
    Data, DeriveInput, Fields, GenericArgument, LitStr, Path, PathArguments, Token, Type, meta::ParseNestedMeta,
    parse_macro_input, spanned::Spanned,
};

/// Derives `Model` for a struct with named fields.
#[proc_macro_derive(Model, attributes(mondoc))]
pub fn derive_model(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    expand(input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

#[derive(Default)]
struct ModelOptions {
    collection: Option<String>,
    connection: Option<String>,
    configure: Option<Path>,
    krate: Option<Path>,
    rename_all: Option<String>,
}

#[derive(Default)]
struct FieldOptions {
    primary: bool,
    column: Option<String>,
    auto_create: bool,
    auto_update: bool,
    embedded: bool,
    hidden: bool,
    serialize_as: Option<String>,
    rename: Option<String>,
    skipped: bool,
}

/// Consumes an attribute entry we don't interpret.
fn skip_meta(meta: &ParseNestedMeta) -> syn::Result<()> {
    if meta.input.peek(Token![=]) {
        let _: syn::Expr = meta.value()?.parse()?;
    } else if meta.input.peek(syn::token::Paren) {
        meta.parse_nested_meta(|inner| skip_meta(&inner))?;
    }
    Ok(())
}

fn string_value(meta: &ParseNestedMeta) -> syn::Result<String> {
    let value: LitStr = meta.value()?.parse()?;
    Ok(value.value())
}

fn model_options(input: &DeriveInput) -> syn::Result<ModelOptions> {
    let mut options = ModelOptions::default();

    for attr in &input.attrs {
        if attr.path().is_ident("mondoc") {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("collection") {
                    options.collection = Some(string_value(&meta)?);
                } else if meta.path.is_ident("connection") {
                    options.connection = Some(string_value(&meta)?);
                } else if meta.path.is_ident("configure") {
                    options.configure = Some(meta.value()?.parse::<LitStr>()?.parse()?);
                } else if meta.path.is_ident("crate") {
                    options.krate = Some(meta.value()?.parse::<LitStr>()?.parse()?);
                } else {
                    return Err(meta.error("unknown mondoc attribute; expected `collection`, `connection`, `configure` or `crate`"));
                }
                Ok(())
            })?;
        } else if attr.path().is_ident("serde") {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("rename_all") && meta.input.peek(Token![=]) {
                    options.rename_all = Some(string_value(&meta)?);
                    Ok(())
                } else {
                    skip_meta(&meta)
                }
            })?;
        }
    }

    Ok(options)
}

fn field_options(field: &syn::Field) -> syn::Result<FieldOptions> {
    let mut options = FieldOptions::default();

    for attr in &field.attrs {
        if attr.path().is_ident("mondoc") {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("primary") {
                    options.primary = true;
                } else if meta.path.is_ident("column") {
                    options.column = Some(string_value(&meta)?);
                } else if meta.path.is_ident("auto_create") {
                    options.auto_create = true;
                } else if meta.path.is_ident("auto_update") {
                    options.auto_update = true;
                } else if meta.path.is_ident("embedded") {
                    options.embedded = true;
                } else if meta.path.is_ident("hidden") {
                    options.hidden = true;
                } else if meta.path.is_ident("serialize_as") {
                    options.serialize_as = Some(string_value(&meta)?);
                } else {
                    return Err(meta.error(
                        "unknown mondoc attribute; expected `primary`, `column`, `auto_create`, `auto_update`, `embedded`, `hidden` or `serialize_as`",
                    ));
                }
                Ok(())
            })?;
        } else if attr.path().is_ident("serde") {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("rename") && meta.input.peek(Token![=]) {
                    options.rename = Some(string_value(&meta)?);
                } else if meta.path.is_ident("skip") || meta.path.is_ident("skip_serializing") || meta.path.is_ident("flatten") {
                    options.skipped = true;
                } else {
                    skip_meta(&meta)?;
                }
                Ok(())
            })?;
        }
    }

    Ok(options)
}

fn snake_case(name: &str) -> String {
    let mut out = String::new();
    for (index, ch) in name.chars().enumerate() {
        if ch.is_uppercase() {
            if index > 0 {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// Applies a serde `rename_all` rule to a snake_case field name.
fn rename_field(name: &str, rule: &str) -> syn::Result<String> {
    let words = name.split('_').filter(|w| !w.is_empty());
    let capitalize = |word: &str| {
        let mut chars = word.chars();
        chars
            .next()
            .map(|first| first.to_uppercase().chain(chars).collect::<String>())
            .unwrap_or_default()
    };

    Ok(match rule {
        "lowercase" => name.to_lowercase(),
        "UPPERCASE" => name.to_uppercase(),
        "snake_case" => name.to_string(),
        "SCREAMING_SNAKE_CASE" => name.to_uppercase(),
        "kebab-case" => name.replace('_', "-"),
        "SCREAMING-KEBAB-CASE" => name.replace('_', "-").to_uppercase(),
        "PascalCase" => words.map(capitalize).collect(),
        "camelCase" => words
            .enumerate()
            .map(|(index, word)| if index == 0 { word.to_string() } else { capitalize(word) })
            .collect(),
        other => {
            return Err(syn::Error::new(
                proc_macro2::Span::call_site(),
                format!("unsupported serde rename_all rule `{other}`"),
            ));
        }
    })
}

/// `Vec<_>` and `Option<Vec<_>>` hold many embedded documents.
fn holds_many(ty: &Type) -> bool {
    let Type::Path(path) = ty else {
        return false;
    };
    let Some(last) = path.path.segments.last() else {
        return false;
    };

    if last.ident == "Vec" {
        return true;
    }
    if last.ident == "Option" {
        if let PathArguments::AngleBracketed(args) = &last.arguments {
            if let Some(GenericArgument::Type(inner)) = args.args.first() {
                return holds_many(inner);
            }
        }
    }
    false
}

fn expand(input: DeriveInput) -> syn::Result<TokenStream2> {
    let ident = &input.ident;
    if !input.generics.params.is_empty() {
        return Err(syn::Error::new(input.generics.span(), "Model cannot be derived for generic types"));
    }

    let Data::Struct(data) = &input.data else {
        return Err(syn::Error::new(input.span(), "Model can only be derived for structs"));
    };
    let Fields::Named(fields) = &data.fields else {
        return Err(syn::Error::new(data.fields.span(), "Model requires named fields"));
    };

    let options = model_options(&input)?;
    let krate = options
        .krate
        .clone()
        .map(|path| quote!(#path))
        .unwrap_or_else(|| quote!(::mondoc));

    let model_name = ident.to_string();
    let collection = options
        .collection
        .clone()
        .unwrap_or_else(|| format!("{}s", snake_case(&model_name)));

    let mut primary = None;
    let mut declared = Vec::new();
    let mut embedded = Vec::new();

    for field in &fields.named {
        let field_options = field_options(field)?;
        if field_options.skipped {
            continue;
        }

        let rust_name = field
            .ident
            .as_ref()
            .map(|ident| ident.to_string().trim_start_matches("r#").to_string())
            .unwrap_or_default();
        let name = match (&field_options.rename, &options.rename_all) {
            (Some(rename), _) => rename.clone(),
            (None, Some(rule)) => rename_field(&rust_name, rule)?,
            (None, None) => rust_name.clone(),
        };

        let mut def = quote!(#krate::schema::FieldDef::new(#name));
        if let Some(column) = &field_options.column {
            def = quote!(#def.with_column(#column));
        }
        if let Some(serialized) = &field_options.serialize_as {
            def = quote!(#def.with_serialized_name(#serialized));
        }
        if field_options.hidden {
            def = quote!(#def.hidden());
        }
        if field_options.auto_create {
            def = quote!(#def.auto_create());
        }
        if field_options.auto_update {
            def = quote!(#def.auto_update());
        }

        if field_options.embedded {
            embedded.push(if holds_many(&field.ty) {
                quote!(#krate::schema::EmbeddedDef::many(#name))
            } else {
                quote!(#krate::schema::EmbeddedDef::single(#name))
            });
        }

        if field_options.primary {
            if primary.is_some() {
                return Err(syn::Error::new(field.span(), "a model has exactly one primary key"));
            }
            primary = Some(def);
        } else if primary.is_none() && !fields.named.iter().any(is_marked_primary) && (name == "_id" || rust_name == "id") {
            primary = Some(def);
        } else {
            declared.push(def);
        }
    }

    let connection = options
        .connection
        .as_ref()
        .map(|name| quote!(.connection(#name)));
    let primary = primary.map(|def| quote!(.primary_key(#def)));
    let configure = options
        .configure
        .as_ref()
        .map(|path| quote!(let builder = #path(builder);));

    Ok(quote! {
        impl #krate::model::Model for #ident {
            fn schema() -> &'static #krate::schema::Schema<Self> {
                static SCHEMA: ::std::sync::OnceLock<#krate::schema::Schema<#ident>> = ::std::sync::OnceLock::new();

                SCHEMA.get_or_init(|| {
                    let builder = #krate::schema::SchemaBuilder::<#ident>::new(#model_name, #collection)
                        #connection
                        #primary
                        #( .field(#declared) )*
                        #( .embedded(#embedded) )*;
                    #configure
                    builder.build()
                })
            }
        }
    })
}

fn is_marked_primary(field: &syn::Field) -> bool {
    field_options(field).is_ok_and(|options| options.primary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rename_rules_match_serde() {
        assert_eq!(rename_field("created_at", "camelCase").unwrap(), "createdAt");
        assert_eq!(rename_field("created_at", "PascalCase").unwrap(), "CreatedAt");
        assert_eq!(rename_field("created_at", "kebab-case").unwrap(), "created-at");
        assert_eq!(rename_field("created_at", "SCREAMING_SNAKE_CASE").unwrap(), "CREATED_AT");
        assert!(rename_field("created_at", "Title Case").is_err());
    }

    #[test]
    fn default_collection_is_plural_snake_case() {
        assert_eq!(snake_case("OrderLine"), "order_line");
    }

    #[test]
    fn vectors_hold_many_documents() {
        let many: Type = syn::parse_quote!(Vec<Address>);
        let optional_many: Type = syn::parse_quote!(Option<Vec<Address>>);
        let single: Type = syn::parse_quote!(Option<Address>);

        assert!(holds_many(&many));
        assert!(holds_many(&optional_many));
        assert!(!holds_many(&single));
    }

    #[test]
    fn derives_schema_declarations() {
        let input: DeriveInput = syn::parse_quote! {
            #[mondoc(collection = "people", connection = "reports")]
            struct Person {
                #[serde(rename = "_id")]
                id: Option<u32>,
                #[mondoc(column = "mail", hidden)]
                email: String,
                #[mondoc(embedded)]
                pets: Vec<Pet>,
            }
        };

        let expanded = expand(input).unwrap().to_string();
        assert!(expanded.contains("primary_key"));
        assert!(expanded.contains("\"people\""));
        assert!(expanded.contains("with_column (\"mail\")"));
        assert!(expanded.contains("EmbeddedDef :: many (\"pets\")"));
    }
}
