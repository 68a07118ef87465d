/*
   gyre, a concurrent cycle-collecting smart pointer library for Rust.
   Copyright (C) 2024 The gyre contributors.

   This program is free software: you can redistribute it and/or modify
   it under the terms of the GNU General Public License as published by
   the Free Software Foundation, either version 3 of the License, or
   (at your option) any later version.

   This program is distributed in the hope that it will be useful,
   but WITHOUT ANY WARRANTY; without even the implied warranty of
   MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
   GNU General Public License for more details.

   You should have received a copy of the GNU General Public License
   along with this program.  If not, see <http://www.gnu.org/licenses/>.
*/

//! Implementation of `#[derive(Cyclic)]` for the `gyre` crate.
//!
//! The generated `accept` delegates to every field of the deriving type, in
//! declaration order, so that construction finds each `Member` and `Anchor`
//! the value owns.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{
    parse_macro_input, Data, DeriveInput, Fields, GenericParam, Index,
};

/// Derive an implementation of `Cyclic` which delegates acceptance to every
/// field of the deriving structure or enum.
#[proc_macro_derive(Cyclic)]
pub fn derive_cyclic(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = &input.ident;

    let body = match &input.data {
        Data::Struct(data) => {
            let visits = visit_fields(&data.fields, |member| quote!(&self.#member));
            quote! { #visits ::core::result::Result::Ok(()) }
        }
        Data::Enum(data) => {
            let arms = data.variants.iter().map(|variant| {
                let variant_name = &variant.ident;
                match &variant.fields {
                    Fields::Unit => quote! {
                        #name::#variant_name => (),
                    },
                    Fields::Named(fields) => {
                        let bindings: Vec<_> = fields
                            .named
                            .iter()
                            .map(|f| f.ident.clone().expect("named field without a name"))
                            .collect();
                        let visits = bindings.iter().map(|b| {
                            quote! { ::gyre::Cyclic::accept(#b, visitor)?; }
                        });
                        quote! {
                            #name::#variant_name { #(#bindings),* } => { #(#visits)* },
                        }
                    }
                    Fields::Unnamed(fields) => {
                        let bindings: Vec<_> = (0..fields.unnamed.len())
                            .map(|i| format_ident!("field{i}"))
                            .collect();
                        let visits = bindings.iter().map(|b| {
                            quote! { ::gyre::Cyclic::accept(#b, visitor)?; }
                        });
                        quote! {
                            #name::#variant_name(#(#bindings),*) => { #(#visits)* },
                        }
                    }
                }
            });
            quote! {
                match self { #(#arms)* }
                ::core::result::Result::Ok(())
            }
        }
        Data::Union(_) => {
            return syn::Error::new_spanned(
                name,
                "`Cyclic` cannot be derived for unions; implement it manually",
            )
            .to_compile_error()
            .into();
        }
    };

    // Every type parameter must itself be `Cyclic` for field delegation to
    // make sense.
    let mut generics = input.generics.clone();
    for param in &mut generics.params {
        if let GenericParam::Type(type_param) = param {
            type_param.bounds.push(syn::parse_quote!(::gyre::Cyclic));
        }
    }
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    quote! {
        unsafe impl #impl_generics ::gyre::Cyclic for #name #ty_generics #where_clause {
            fn accept<V: ::gyre::Visitor>(
                &self,
                visitor: &mut V,
            ) -> ::core::result::Result<(), ::gyre::Error> {
                #body
            }
        }
    }
    .into()
}

/// Generate a delegated `accept` call for every field of a struct.
fn visit_fields(
    fields: &Fields,
    access: impl Fn(TokenStream2) -> TokenStream2,
) -> TokenStream2 {
    match fields {
        Fields::Unit => TokenStream2::new(),
        Fields::Named(fields) => fields
            .named
            .iter()
            .map(|f| {
                let ident = f.ident.as_ref().expect("named field without a name");
                let place = access(quote!(#ident));
                quote! { ::gyre::Cyclic::accept(#place, visitor)?; }
            })
            .collect(),
        Fields::Unnamed(fields) => (0..fields.unnamed.len())
            .map(|i| {
                let index = Index::from(i);
                let place = access(quote!(#index));
                quote! { ::gyre::Cyclic::accept(#place, visitor)?; }
            })
            .collect(),
    }
}
