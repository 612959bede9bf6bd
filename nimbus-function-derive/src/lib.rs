//! A derive macro for the `RemoteFunction` trait.
//!
//! Remote functions are declared, not discovered: the entry point name, the
//! parameter contract and the modules the function needs at execution time are
//! all stated up front on the type. The job builder relies on this declaration
//! to validate call arguments, to detect object-processing functions and to
//! bundle dependencies into the computation unit.
//!
//! # Attributes
//!
//! All attributes live under `#[nimbus(...)]`:
//! - `name = "..."`: the entry point name. Defaults to the type name.
//! - `params(a, b, ...)`: the declared parameters, in positional order.
//! - `modules("pkg", "pkg.sub", ...)`: the modules referenced by the function.
//! - `internal`: used when deriving from inside the `nimbus` crate itself.
//!
//! # Example
//!
//! ```ignore
//! #[derive(Serialize, Deserialize, RemoteFunction)]
//! #[nimbus(name = "word_count", params(obj), modules("textutils"))]
//! struct WordCount;
//! ```
extern crate proc_macro;

use std::collections::BTreeSet;

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse::Parse, parse_macro_input, DeriveInput, Error, LitStr, Result, Token};

/// The declaration collected from the `#[nimbus(...)]` attributes.
#[derive(Default)]
struct Declaration {
    is_internal: bool,
    name: Option<LitStr>,
    params: Vec<String>,
    modules: Vec<LitStr>,
}

fn parse_declaration(input: &mut DeriveInput) -> Result<Declaration> {
    let mut declaration = Declaration::default();
    let mut errors: Option<Error> = None;

    input.attrs.retain(|attr| {
        if !attr.path().is_ident("nimbus") {
            return true;
        }
        if let Err(err) = attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("internal") {
                if declaration.is_internal {
                    return Err(meta.error("duplicate nimbus crate attribute"));
                }
                declaration.is_internal = true;
                Ok(())
            } else if meta.path.is_ident("name") {
                if declaration.name.is_some() {
                    return Err(meta.error("duplicate nimbus name attribute"));
                }
                declaration.name = Some(meta.value()?.parse()?);
                Ok(())
            } else if meta.path.is_ident("params") {
                let mut seen = BTreeSet::new();
                meta.parse_nested_meta(|param| {
                    let ident = param
                        .path
                        .get_ident()
                        .ok_or_else(|| param.error("parameters must be plain identifiers"))?;
                    let param_name = ident.to_string();
                    if !seen.insert(param_name.clone()) {
                        return Err(param.error(format!("duplicate parameter `{param_name}`")));
                    }
                    declaration.params.push(param_name);
                    Ok(())
                })
            } else if meta.path.is_ident("modules") {
                let content;
                syn::parenthesized!(content in meta.input);
                let modules = content.parse_terminated(<LitStr as Parse>::parse, Token![,])?;
                declaration.modules.extend(modules);
                Ok(())
            } else {
                Err(meta.error("unsupported nimbus attribute"))
            }
        }) {
            match &mut errors {
                None => errors = Some(err),
                Some(errors) => errors.combine(err),
            }
        }
        false
    });

    match errors {
        None => Ok(declaration),
        Some(errors) => Err(errors),
    }
}

/// See the [module level documentation](crate) for more information.
#[proc_macro_derive(RemoteFunction, attributes(nimbus))]
pub fn remote_function_derive(input: TokenStream) -> TokenStream {
    let mut input = parse_macro_input!(input as DeriveInput);

    let declaration = match parse_declaration(&mut input) {
        Ok(declaration) => declaration,
        Err(err) => return err.to_compile_error().into(),
    };

    // The path to the `nimbus` crate.
    // If the derive macro is being called from the `nimbus` crate itself, then
    // the path is `crate`, otherwise it is `::nimbus`.
    let nimbus_path = if declaration.is_internal {
        quote! { crate }
    } else {
        quote! { ::nimbus }
    };

    let ident = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let name = declaration
        .name
        .map(|name| name.value())
        .unwrap_or_else(|| ident.to_string());
    if name.trim().is_empty() {
        return Error::new(ident.span(), "remote function name cannot be empty")
            .to_compile_error()
            .into();
    }
    let params = &declaration.params;
    let modules = &declaration.modules;

    let expanded = quote! {
        impl #impl_generics #nimbus_path::function::RemoteFunction for #ident #ty_generics #where_clause {
            const NAME: &'static str = #name;
            const PARAMETERS: &'static [&'static str] = &[#(#params),*];
            const MODULES: &'static [&'static str] = &[#(#modules),*];
        }
    };

    TokenStream::from(expanded)
}
