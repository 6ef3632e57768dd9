//! Proc macros for loregraph entity schemas.
//!
//! Provides `#[derive(EntitySchema)]`, which turns an annotated struct into a
//! catalog `TypeSchema`: attribute kinds come from the field types, while
//! constraints and merge policies come from `#[attr(...)]` annotations.
//!
//! # Example
//!
//! ```ignore
//! /// A named character in the narrative.
//! #[derive(EntitySchema)]
//! #[entity(name = "character", table = "characters")]
//! struct Character {
//!     /// Life story prior to the narrative.
//!     #[attr(min_length = 100, merge = "last_write_wins")]
//!     backstory: Option<String>,
//!     /// Overall power rating.
//!     #[attr(range(min = 1, max = 10), merge = "max")]
//!     power_level: Option<i64>,
//! }
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::punctuated::Punctuated;
use syn::{parse_macro_input, DeriveInput, Expr, Field, Lit, LitInt, LitStr, Meta, Token, Type};

/// Derive macro for catalog schemas.
///
/// # Attributes
///
/// - `#[entity(name = "...")]` - Entity type name (defaults to the snake_case struct name)
/// - `#[entity(table = "...")]` - Store the type in its own table instead of the generic one
/// - `#[entity(strict)]` - Reject attributes that are not declared
/// - `#[attr(rename = "...")]` - Override the attribute name
/// - `#[attr(required)]` / `#[attr(optional)]` - Override requiredness inferred from the type
/// - `#[attr(kind = "...")]` - Override the inferred attribute kind
/// - `#[attr(min_length = N)]`, `#[attr(max_length = N)]`
/// - `#[attr(range(min = A, max = B))]`, `#[attr(non_negative)]`
/// - `#[attr(one_of("a", "b"))]`
/// - `#[attr(merge = "union" | "max" | "last_write_wins")]`
#[proc_macro_derive(EntitySchema, attributes(entity, attr))]
pub fn derive_entity_schema(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand_entity_schema(input)
        .unwrap_or_else(|err| err.to_compile_error())
        .into()
}

#[derive(Default)]
struct EntityOptions {
    name: Option<String>,
    table: Option<String>,
    strict: bool,
}

#[derive(Default)]
struct AttrOptions {
    rename: Option<String>,
    required: Option<bool>,
    kind: Option<String>,
    constraints: Vec<TokenStream2>,
    merge: Option<TokenStream2>,
}

fn expand_entity_schema(input: DeriveInput) -> syn::Result<TokenStream2> {
    let struct_name = &input.ident;
    let options = parse_entity_options(&input)?;
    let entity_name = options
        .name
        .unwrap_or_else(|| to_snake_case(&struct_name.to_string()));
    let description = get_doc_comment(&input.attrs);

    let fields = match &input.data {
        syn::Data::Struct(data) => match &data.fields {
            syn::Fields::Named(named) => &named.named,
            _ => {
                return Err(syn::Error::new_spanned(
                    &input,
                    "EntitySchema derive only supports structs with named fields",
                ))
            }
        },
        _ => {
            return Err(syn::Error::new_spanned(
                &input,
                "EntitySchema derive only supports structs",
            ))
        }
    };

    let mut attribute_tokens = Vec::new();
    for field in fields {
        attribute_tokens.push(expand_field(field)?);
    }

    let description_token = if description.is_empty() {
        quote! {}
    } else {
        quote! { .with_description(#description) }
    };
    let table_token = match options.table {
        Some(table) => quote! { .with_table(#table) },
        None => quote! {},
    };
    let strict = options.strict;

    Ok(quote! {
        impl ::loregraph_core::catalog::EntitySchema for #struct_name {
            const ENTITY_TYPE: &'static str = #entity_name;

            fn type_schema() -> ::loregraph_core::catalog::TypeSchema {
                ::loregraph_core::catalog::TypeSchema::new(#entity_name)
                    #description_token
                    #table_token
                    .strict(#strict)
                    #(.with_attribute(#attribute_tokens))*
            }
        }
    })
}

fn parse_entity_options(input: &DeriveInput) -> syn::Result<EntityOptions> {
    let mut options = EntityOptions::default();
    for attr in &input.attrs {
        if !attr.path().is_ident("entity") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("name") {
                let value: LitStr = meta.value()?.parse()?;
                options.name = Some(value.value());
            } else if meta.path.is_ident("table") {
                let value: LitStr = meta.value()?.parse()?;
                options.table = Some(value.value());
            } else if meta.path.is_ident("strict") {
                options.strict = true;
            } else {
                return Err(meta.error("unsupported entity option"));
            }
            Ok(())
        })?;
    }
    Ok(options)
}

fn parse_attr_options(field: &Field) -> syn::Result<AttrOptions> {
    let mut options = AttrOptions::default();
    for attr in &field.attrs {
        if !attr.path().is_ident("attr") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("rename") {
                let value: LitStr = meta.value()?.parse()?;
                options.rename = Some(value.value());
            } else if meta.path.is_ident("required") {
                options.required = Some(true);
            } else if meta.path.is_ident("optional") {
                options.required = Some(false);
            } else if meta.path.is_ident("kind") {
                let value: LitStr = meta.value()?.parse()?;
                options.kind = Some(value.value());
            } else if meta.path.is_ident("min_length") {
                let value: LitInt = meta.value()?.parse()?;
                options.constraints.push(quote! {
                    ::loregraph_core::catalog::Constraint::MinLength(#value)
                });
            } else if meta.path.is_ident("max_length") {
                let value: LitInt = meta.value()?.parse()?;
                options.constraints.push(quote! {
                    ::loregraph_core::catalog::Constraint::MaxLength(#value)
                });
            } else if meta.path.is_ident("non_negative") {
                options.constraints.push(quote! {
                    ::loregraph_core::catalog::Constraint::NonNegative
                });
            } else if meta.path.is_ident("range") {
                let mut min: Option<Expr> = None;
                let mut max: Option<Expr> = None;
                meta.parse_nested_meta(|bound| {
                    if bound.path.is_ident("min") {
                        min = Some(bound.value()?.parse()?);
                    } else if bound.path.is_ident("max") {
                        max = Some(bound.value()?.parse()?);
                    } else {
                        return Err(bound.error("expected `min` or `max`"));
                    }
                    Ok(())
                })?;
                let (Some(min), Some(max)) = (min, max) else {
                    return Err(meta.error("range needs both `min` and `max`"));
                };
                options.constraints.push(quote! {
                    ::loregraph_core::catalog::Constraint::Range {
                        min: (#min) as f64,
                        max: (#max) as f64,
                    }
                });
            } else if meta.path.is_ident("one_of") {
                let content;
                syn::parenthesized!(content in meta.input);
                let values = Punctuated::<LitStr, Token![,]>::parse_terminated(&content)?;
                let values: Vec<_> = values.iter().map(|v| v.value()).collect();
                options.constraints.push(quote! {
                    ::loregraph_core::catalog::Constraint::OneOf(
                        vec![#(#values.to_string()),*]
                    )
                });
            } else if meta.path.is_ident("merge") {
                let value: LitStr = meta.value()?.parse()?;
                let policy = match value.value().as_str() {
                    "union" => quote! { ::loregraph_core::catalog::MergePolicy::Union },
                    "max" => quote! { ::loregraph_core::catalog::MergePolicy::Max },
                    "last_write_wins" => {
                        quote! { ::loregraph_core::catalog::MergePolicy::LastWriteWins }
                    }
                    other => {
                        return Err(syn::Error::new_spanned(
                            &value,
                            format!("unknown merge policy `{other}`"),
                        ))
                    }
                };
                options.merge = Some(policy);
            } else {
                return Err(meta.error("unsupported attr option"));
            }
            Ok(())
        })?;
    }
    Ok(options)
}

fn expand_field(field: &Field) -> syn::Result<TokenStream2> {
    let options = parse_attr_options(field)?;
    let Some(ident) = field.ident.as_ref() else {
        return Err(syn::Error::new_spanned(field, "expected a named field"));
    };
    let name = options.rename.unwrap_or_else(|| ident.to_string());
    let kind = match options.kind {
        Some(kind) => kind_tokens_from_name(&kind, field)?,
        None => kind_tokens(&field.ty),
    };
    let required = options
        .required
        .unwrap_or(!is_option_type(&field.ty) && !is_vec_type(&field.ty));

    let doc = get_doc_comment(&field.attrs);
    let doc_token = if doc.is_empty() {
        quote! {}
    } else {
        quote! { .with_description(#doc) }
    };
    let constraints = &options.constraints;
    let merge_token = match options.merge {
        Some(policy) => quote! { .with_merge(#policy) },
        None => quote! {},
    };

    Ok(quote! {
        ::loregraph_core::catalog::AttributeDef::new(#name, #kind)
            .required(#required)
            #doc_token
            #(.with_constraint(#constraints))*
            #merge_token
    })
}

fn kind_tokens_from_name(kind: &str, field: &Field) -> syn::Result<TokenStream2> {
    Ok(match kind {
        "text" => quote! { ::loregraph_core::catalog::AttrKind::Text },
        "integer" => quote! { ::loregraph_core::catalog::AttrKind::Integer },
        "number" => quote! { ::loregraph_core::catalog::AttrKind::Number },
        "boolean" => quote! { ::loregraph_core::catalog::AttrKind::Boolean },
        "list" => quote! { ::loregraph_core::catalog::AttrKind::List },
        "object" => quote! { ::loregraph_core::catalog::AttrKind::Object },
        other => {
            return Err(syn::Error::new_spanned(
                field,
                format!("unknown attribute kind `{other}`"),
            ))
        }
    })
}

fn get_doc_comment(attrs: &[syn::Attribute]) -> String {
    let mut docs = Vec::new();
    for attr in attrs {
        if attr.path().is_ident("doc") {
            if let Meta::NameValue(nv) = &attr.meta {
                if let syn::Expr::Lit(expr_lit) = &nv.value {
                    if let Lit::Str(s) = &expr_lit.lit {
                        docs.push(s.value().trim().to_string());
                    }
                }
            }
        }
    }
    docs.join(" ")
}

fn last_segment(ty: &Type) -> Option<&syn::PathSegment> {
    if let Type::Path(type_path) = ty {
        return type_path.path.segments.last();
    }
    None
}

fn is_option_type(ty: &Type) -> bool {
    last_segment(ty).is_some_and(|segment| segment.ident == "Option")
}

fn is_vec_type(ty: &Type) -> bool {
    last_segment(ty).is_some_and(|segment| segment.ident == "Vec")
}

fn kind_tokens(ty: &Type) -> TokenStream2 {
    let Some(segment) = last_segment(ty) else {
        return quote! { ::loregraph_core::catalog::AttrKind::Object };
    };
    match segment.ident.to_string().as_str() {
        "String" | "str" => quote! { ::loregraph_core::catalog::AttrKind::Text },
        "i8" | "i16" | "i32" | "i64" | "isize" | "u8" | "u16" | "u32" | "u64" | "usize" => {
            quote! { ::loregraph_core::catalog::AttrKind::Integer }
        }
        "f32" | "f64" => quote! { ::loregraph_core::catalog::AttrKind::Number },
        "bool" => quote! { ::loregraph_core::catalog::AttrKind::Boolean },
        "Vec" => quote! { ::loregraph_core::catalog::AttrKind::List },
        "Option" => {
            if let syn::PathArguments::AngleBracketed(args) = &segment.arguments {
                if let Some(syn::GenericArgument::Type(inner)) = args.args.first() {
                    return kind_tokens(inner);
                }
            }
            quote! { ::loregraph_core::catalog::AttrKind::Object }
        }
        _ => quote! { ::loregraph_core::catalog::AttrKind::Object },
    }
}

fn to_snake_case(s: &str) -> String {
    let mut result = String::new();
    for (i, c) in s.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                result.push('_');
            }
            result.push(c.to_ascii_lowercase());
        } else {
            result.push(c);
        }
    }
    result
}
