use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, DeriveInput};

/// Implements `From<YourError> for backlog::JobError`, using the `Debug`
/// representation of the error as the job error description.
#[proc_macro_derive(ToJobError)]
pub fn to_job_error(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let gen = quote! {
        impl #impl_generics ::core::convert::From<#name #ty_generics> for ::backlog::JobError #where_clause {
            fn from(error: #name #ty_generics) -> Self {
                ::backlog::JobError::new(format!("{:?}", error))
            }
        }
    };

    gen.into()
}
