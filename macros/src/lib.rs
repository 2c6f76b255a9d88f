//! Proc-macros used by persisted GC3Pie-rs objects.
//!
//! The Store (see `gc3_core::store`) needs every persisted object kind to
//! carry a schema version so `Store::load` can run an upgrade hook before
//! handing the object back to the caller (spec §4.7). Writing the
//! bookkeeping field and `Versioned` impl by hand on every `Task`,
//! `TaskGroup` and resource-config struct is the kind of boilerplate a
//! derive macro exists to remove.

use darling::ast::NestedMeta;
use darling::FromMeta;
use proc_macro::TokenStream;
use quote::quote;
use syn::parse::Parser;
use syn::{parse_macro_input, Data, DeriveInput, Fields, Ident, LitInt};

#[derive(Debug, FromMeta)]
struct VersionArgs {
    #[darling(default)]
    since: Option<usize>,
}

impl Default for VersionArgs {
    fn default() -> Self {
        Self { since: Some(1) }
    }
}

/// Adds a `schema_version: usize` field to a struct and implements
/// `Versioned` for it, with the current schema version taken from the macro
/// argument (defaults to `1`).
///
/// ```ignore
/// #[add_version(1)]
/// #[derive(Clone, Debug, Serialize, Deserialize)]
/// struct TaskRecord { /* ... */ }
/// ```
#[proc_macro_attribute]
pub fn add_version(args: TokenStream, input: TokenStream) -> TokenStream {
    let version_value = syn::parse::<LitInt>(args.clone())
        .map(|lit| lit.base10_parse::<usize>().unwrap_or(1))
        .unwrap_or_else(|_| {
            let attrs = NestedMeta::parse_meta_list(args.into()).unwrap_or_default();
            VersionArgs::from_list(&attrs)
                .unwrap_or_default()
                .since
                .unwrap_or(1)
        });

    let mut input = parse_macro_input!(input as DeriveInput);
    let ident = &input.ident;
    let version_ident = Ident::new("schema_version", ident.span());

    let output = match &mut input.data {
        Data::Struct(data_struct) => {
            if let Fields::Named(fields) = &mut data_struct.fields {
                fields.named.push(
                    syn::Field::parse_named
                        .parse2(quote! { pub #version_ident: usize })
                        .expect("parse schema_version field"),
                );
                // Catch-all for fields a future schema version adds (§4.7:
                // "unknown fields are preserved verbatim to allow round-trip
                // downgrade"). `#[serde(default)]` so values saved before
                // this field existed still deserialize.
                fields.named.push(
                    syn::Field::parse_named
                        .parse2(quote! {
                            #[serde(flatten, default)]
                            pub extra: ::serde_json::Map<String, ::serde_json::Value>
                        })
                        .expect("parse extra field"),
                );
            }
            quote! {
                #input

                impl gc3_common::Versioned for #ident {
                    fn schema_version(&self) -> usize {
                        self.#version_ident
                    }

                    fn current_version() -> usize {
                        #version_value
                    }
                }
            }
        }
        _ => panic!("#[add_version] only applies to structs with named fields"),
    };
    output.into()
}
