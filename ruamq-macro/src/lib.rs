//! # ruamq procedural macros
//!
//! ## `#[service]`
//!
//! Turns a trait of synchronous methods into a queue-routed RPC service:
//!
//! ```rust,ignore
//! #[ruamq::service]
//! pub trait Calculator {
//!     fn add(&self, a: i32, b: i32) -> String;
//!     fn reset(&self);
//! }
//! ```
//!
//! For every method the macro derives a [`Signature`] from the source tokens:
//! the return type (`void` when there is none), the name `Trait.method`, and
//! the parameter types with whitespace removed. It generates:
//! 1. a `ruamq_export` method binding every signature to an implementation;
//! 2. a `{Trait}Client` struct with one async method per trait method.
//!
//! Parameter types must be owned and deserializable.
//!
//! [`Signature`]: https://docs.rs/ruamq/latest/ruamq/struct.Signature.html

use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{FnArg, ItemTrait, Pat, ReturnType, TraitItem, Type, parse_macro_input};

/// Procedural macro for defining queue-routed RPC services.
///
/// # Panics
///
/// Panics at compile time if a method is not of the form
/// `fn method(&self, arg: Type, ...) [-> Ret]`, or is named `ruamq_export`.
#[proc_macro_attribute]
pub fn service(_attr: TokenStream, input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as ItemTrait);

    let trait_ident = &input.ident;
    let visibility = &input.vis;
    let trait_name = trait_ident.to_string();
    let client_ident = format_ident!("{trait_ident}Client");

    let krate = get_crate_name();

    let mut bindings = vec![];
    let mut client_methods = vec![];

    for item in &input.items {
        let TraitItem::Fn(method) = item else {
            continue;
        };
        let sig = &method.sig;
        let is_ref_self = matches!(
            sig.inputs.first(),
            Some(FnArg::Receiver(receiver)) if receiver.reference.is_some() && receiver.mutability.is_none()
        );
        if sig.asyncness.is_some() || !is_ref_self {
            panic!("the function should be in the form `fn func(&self, arg: Arg, ...) -> Ret`.");
        }
        let method_ident = &sig.ident;
        if *method_ident == "ruamq_export" {
            panic!("the function cannot be named `ruamq_export`!");
        }
        let method_name = format!("{trait_name}.{method_ident}");

        let mut arg_idents = vec![];
        let mut arg_types = vec![];
        for (i, input) in sig.inputs.iter().skip(1).enumerate() {
            let FnArg::Typed(arg) = input else {
                panic!("unexpected receiver in `{method_name}`");
            };
            let ident = match &*arg.pat {
                Pat::Ident(pat) => pat.ident.clone(),
                _ => format_ident!("arg_{i}"),
            };
            arg_idents.push(ident);
            arg_types.push((*arg.ty).clone());
        }
        let arg_type_names: Vec<String> = arg_types.iter().map(type_name).collect();
        let arg_count = arg_type_names.len();

        let (return_type, return_type_name) = match &sig.output {
            ReturnType::Type(_, ty) if !is_unit(ty) => ((**ty).clone(), type_name(ty)),
            _ => (syn::parse_quote!(()), "void".to_owned()),
        };

        let make_signature = quote! {
            let __args: [&str; #arg_count] = [#(#arg_type_names),*];
            let __signature = #krate::Signature::new(#return_type_name, #method_name, __args);
        };

        bindings.push(quote! {
            {
                #make_signature
                let __this = self.clone();
                client.bind(
                    &__signature,
                    move |(#(#arg_idents,)*): (#(#arg_types,)*)| __this.#method_ident(#(#arg_idents),*),
                )?;
            }
        });

        client_methods.push(quote! {
            pub async fn #method_ident(&self, #(#arg_idents: #arg_types),*) -> #krate::Result<#return_type> {
                #make_signature
                self.client.call(&__signature, (#(#arg_idents,)*)).await
            }
        });
    }

    let input_items = &input.items;
    let supertraits = &input.supertraits;
    let colon = input.colon_token;
    let attrs = &input.attrs;
    quote! {
        #(#attrs)*
        #visibility trait #trait_ident #colon #supertraits {
            const NAME: &'static str = #trait_name;

            #(#input_items)*

            /// Binds every method of this service on `client`.
            fn ruamq_export<C: #krate::Codec>(
                self: ::std::sync::Arc<Self>,
                client: &#krate::QueueClient<C>,
            ) -> #krate::Result<()>
            where
                Self: Sized + Send + Sync + 'static,
            {
                #(#bindings)*
                Ok(())
            }
        }

        #[doc = concat!("Typed client of [`", #trait_name, "`].")]
        #[derive(Clone)]
        #visibility struct #client_ident<C: #krate::Codec = #krate::MsgPackCodec> {
            client: ::std::sync::Arc<#krate::QueueClient<C>>,
        }

        impl<C: #krate::Codec> #client_ident<C> {
            pub fn new(client: ::std::sync::Arc<#krate::QueueClient<C>>) -> Self {
                Self { client }
            }

            #(#client_methods)*
        }
    }
    .into()
}

/// Source spelling of a type with all whitespace removed.
fn type_name(ty: &Type) -> String {
    quote!(#ty)
        .to_string()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect()
}

fn is_unit(ty: &Type) -> bool {
    matches!(ty, Type::Tuple(tuple) if tuple.elems.is_empty())
}

/// Path of the `ruamq` crate as seen from the macro call site.
///
/// Inside `ruamq` itself this is `crate`; its integration tests and every
/// dependent crate see `::ruamq` (or the renamed dependency).
pub(crate) fn get_crate_name() -> proc_macro2::TokenStream {
    match proc_macro_crate::crate_name("ruamq") {
        Ok(proc_macro_crate::FoundCrate::Name(name)) => {
            let ident = syn::Ident::new(&name, proc_macro2::Span::call_site());
            quote! { ::#ident }
        }
        Ok(proc_macro_crate::FoundCrate::Itself)
            if std::env::var("CARGO_CRATE_NAME").as_deref() == Ok("ruamq") =>
        {
            quote! { crate }
        }
        _ => quote! { ::ruamq },
    }
}
