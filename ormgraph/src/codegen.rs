//! Rust source emission
//!
//! Renders generated type descriptors as `async-graphql` derive structs, for
//! projects that prefer compiled types over the runtime schema.

use heck::ToSnakeCase;
use proc_macro2::{Ident, Span, TokenStream};
use quote::{format_ident, quote};

use crate::error::CodegenError;
use crate::types::{GeneratedType, InputTypeDef, ObjectTypeDef, TypeRef, TypeRegistry};

const RUST_KEYWORDS: &[&str] = &[
    "as", "async", "await", "break", "const", "continue", "dyn", "else", "enum", "extern", "false", "fn", "for", "gen",
    "if", "impl", "in", "let", "loop", "match", "mod", "move", "mut", "pub", "ref", "return", "static", "struct",
    "trait", "true", "type", "unsafe", "use", "where", "while", "abstract", "become", "box", "do", "final", "macro",
    "override", "priv", "try", "typeof", "unsized", "virtual", "yield",
];

/// Keywords that cannot be raw identifiers
const RESERVED: &[&str] = &["self", "Self", "super", "crate", "_"];

/// Identifier for a field name, escaping Rust keywords
pub fn escape_rust_keyword(name: &str) -> Ident {
    let name = name.to_snake_case();
    if RESERVED.contains(&name.as_str()) {
        format_ident!("{}_", name)
    } else if RUST_KEYWORDS.contains(&name.as_str()) {
        Ident::new_raw(&name, Span::call_site())
    } else {
        format_ident!("{}", name)
    }
}

/// Render every object and input type of the registry as one Rust file
pub fn render_types(registry: &TypeRegistry) -> Result<String, CodegenError> {
    let items: Vec<TokenStream> = registry
        .iter()
        .map(|ty| match ty {
            GeneratedType::Object(def) => object_struct(def),
            GeneratedType::Input(def) => input_struct(def),
        })
        .collect();

    let code = quote! {
        //! GraphQL types generated from model metadata
        //! @generated

        #![allow(missing_docs)]
        #![allow(clippy::all)]

        use async_graphql::{InputObject, SimpleObject, ID};

        #(#items)*
    };
    let parsed = syn::parse_file(&code.to_string())?;
    Ok(prettyplease::unparse(&parsed))
}

fn object_struct(def: &ObjectTypeDef) -> TokenStream {
    let ident = format_ident!("{}", def.name);
    let name = &def.name;
    let doc = doc_attr(def.description.as_deref());
    let fields = def.fields.iter().map(|field| {
        let ident = escape_rust_keyword(&field.name);
        let graphql_name = &field.name;
        let ty = rust_type(&field.ty, true);
        let doc = doc_attr(field.description.as_deref());
        quote! {
            #doc
            #[graphql(name = #graphql_name)]
            pub #ident: #ty,
        }
    });
    quote! {
        #doc
        #[derive(SimpleObject, Clone, Debug)]
        #[graphql(name = #name)]
        pub struct #ident {
            #(#fields)*
        }
    }
}

fn input_struct(def: &InputTypeDef) -> TokenStream {
    let ident = format_ident!("{}", def.name);
    let name = &def.name;
    let doc = doc_attr(def.description.as_deref());
    let fields = def.fields.iter().map(|field| {
        let ident = escape_rust_keyword(&field.name);
        let graphql_name = &field.name;
        let ty = rust_type(&field.ty, false);
        let doc = doc_attr(field.description.as_deref());
        quote! {
            #doc
            #[graphql(name = #graphql_name)]
            pub #ident: #ty,
        }
    });
    quote! {
        #doc
        #[derive(InputObject, Clone, Debug)]
        #[graphql(name = #name)]
        pub struct #ident {
            #(#fields)*
        }
    }
}

fn doc_attr(description: Option<&str>) -> TokenStream {
    match description {
        Some(text) => quote! { #[doc = #text] },
        None => quote! {},
    }
}

/// Rust type for a GraphQL type reference
///
/// Object references outside lists are boxed so mutually referencing types
/// stay finitely sized.
fn rust_type(ty: &TypeRef, boxed: bool) -> TokenStream {
    match ty {
        TypeRef::NonNull(inner) => required_type(inner, boxed),
        other => {
            let inner = required_type(other, boxed);
            quote! { Option<#inner> }
        }
    }
}

fn required_type(ty: &TypeRef, boxed: bool) -> TokenStream {
    match ty {
        TypeRef::NonNull(inner) => required_type(inner, boxed),
        TypeRef::List(inner) => {
            let item = rust_type(inner, false);
            quote! { Vec<#item> }
        }
        TypeRef::Named(name) => match name.as_str() {
            "ID" => quote! { ID },
            "String" | "DateTime" | "Date" | "Time" | "Decimal" | "UUID" | "Duration" => quote! { String },
            "Int" => quote! { i64 },
            "Float" => quote! { f64 },
            "Boolean" => quote! { bool },
            "JSON" => quote! { async_graphql::Json<async_graphql::Value> },
            other => {
                let ident = format_ident!("{}", other);
                if boxed {
                    quote! { Box<#ident> }
                } else {
                    quote! { #ident }
                }
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::TypeGeneratorSettings;
    use crate::test_fixtures::blog_registry;
    use crate::types::{MutationKind, TypeGenerator};
    use std::sync::Arc;

    fn rendered() -> String {
        let mut types = TypeGenerator::new(Arc::new(blog_registry()), TypeGeneratorSettings::default());
        types.generate_object_type("Post").unwrap();
        types.generate_object_type("Category").unwrap();
        types
            .generate_input_type("Post", false, MutationKind::Create, true)
            .unwrap();
        render_types(types.registry()).unwrap()
    }

    #[test]
    fn test_escape_rust_keyword() {
        assert_eq!(escape_rust_keyword("type").to_string(), "r#type");
        assert_eq!(escape_rust_keyword("self").to_string(), "self_");
        assert_eq!(escape_rust_keyword("createdAt").to_string(), "created_at");
        assert_eq!(escape_rust_keyword("title").to_string(), "title");
    }

    #[test]
    fn test_render_object_types() {
        let code = rendered();
        assert!(code.contains("@generated"));
        assert!(code.contains("#[derive(SimpleObject, Clone, Debug)]"));
        assert!(code.contains("pub struct Post {"));
        assert!(code.contains("pub category: Box<Category>,"));
        assert!(code.contains("pub tags: Vec<Tag>,"));
        assert!(code.contains("pub post_set: Vec<Post>,"));
        assert!(code.contains("pub created_at: String,"));
        assert!(code.contains("pub title_length: Option<i64>,"));
    }

    #[test]
    fn test_render_input_types() {
        let code = rendered();
        assert!(code.contains("#[derive(InputObject, Clone, Debug)]"));
        assert!(code.contains("pub struct PostCreateInput {"));
        assert!(code.contains("pub category: ID,"));
        assert!(code.contains("pub tags: Option<Vec<ID>>,"));
        assert!(code.contains("pub nested_category: Option<CategoryNestedCreateInput>,"));
        assert!(code.contains("#[graphql(name = \"nested_category\")]"));
    }
}
